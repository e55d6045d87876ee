pub mod api;
pub mod db;
pub mod partner_http;
pub mod station_commands;
