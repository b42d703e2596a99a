mod tcp_server;

pub use tcp_server::{parse_request, Handler, TcpServer};
