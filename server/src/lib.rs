//! Golden Horde relay - Tent presence and WebRTC signaling hub.
//!
//! This crate provides the relay that sits next to the Golden Horde web
//! application, responsible for:
//! - Tracking which user is connected to which tent
//! - Routing opaque signaling payloads between tent participants
//! - Publishing join/leave events to horde-wide observers
//!
//! # Architecture
//!
//! Each WebSocket connection owns a channel in the [`broadcast`] registry and
//! is driven by a session: [`session::TentSession`] for tent endpoints and
//! [`hub::ObserverSession`] for the observer endpoint. Sessions record
//! presence in a TTL cache ([`presence`]) and participation in a
//! [`store::TentStore`] ([`membership`]). Media never flows through the
//! relay.

pub mod auth;
pub mod broadcast;
pub mod cache;
pub mod config;
pub mod error;
pub mod hub;
pub mod identity;
pub mod membership;
pub mod message;
pub mod presence;
pub mod routes;
pub mod session;
pub mod store;
pub mod types;
