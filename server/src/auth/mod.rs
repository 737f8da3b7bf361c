pub mod handshake;
pub mod jwt;
pub mod middleware;
