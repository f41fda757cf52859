pub mod auth;
pub mod conversation;
pub mod db;
pub mod error;
pub mod identity;
pub mod message;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod store;
pub mod websocket;
