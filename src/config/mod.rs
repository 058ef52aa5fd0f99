// Configuration modules for the relay gateway

pub mod settings;

pub use settings::GatewaySettings;
