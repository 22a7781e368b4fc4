pub mod db;
pub mod tracking;
