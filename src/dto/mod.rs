pub mod health;
pub mod pollers;
