//! Core trait definitions

mod portal;

pub use portal::{NavigationWatch, PortalClient, LOGIN_PATH, LOGOUT_PATH, STATUS_PATH};
