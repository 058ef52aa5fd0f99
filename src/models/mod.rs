pub mod api_key;
pub mod principal;

pub use api_key::{AccountBindings, KeyRecord};
pub use principal::PrincipalContext;
