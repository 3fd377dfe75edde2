pub mod backend;
pub mod download_service;
pub mod filesystem_backend;
pub mod ledger;
pub mod maintenance;
pub mod membership;
pub mod objects;
pub mod retry;
pub mod upload_service;
