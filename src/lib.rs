pub mod api;
pub mod config;
mod orm;
pub mod qr_encoder;
pub mod qr_repo;
pub mod qr_service;
pub mod short_id;

#[cfg(test)]
mod testing;
