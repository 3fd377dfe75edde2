pub mod dispatch;
pub mod routes;
