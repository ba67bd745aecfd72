pub mod config;
pub mod error;
pub mod event_loop;
pub mod logging;
pub mod models;
pub mod mqtt2rest_unit;
pub mod mqtt_service;
pub mod rest2mqtt_unit;
pub mod rest_client;
pub mod rest_server;
pub mod service_utils;
