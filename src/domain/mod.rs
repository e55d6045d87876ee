pub mod consumption;
pub mod models;
pub mod ocpi;
pub mod oicp;
pub mod policy;
pub mod session_state;
pub mod sync_result;
