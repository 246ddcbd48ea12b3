pub mod approval;
pub mod request;
pub mod resource;
pub mod user;
