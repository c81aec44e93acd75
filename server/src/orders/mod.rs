pub mod crud;
pub mod store;
pub mod tracking;
