//! Stand-in provider endpoints for transport and pipeline tests

pub mod mock_http;
pub mod mock_server;

pub use mock_http::MockHttpProvider;
pub use mock_server::{MockSmtpServer, SmtpCommand};
