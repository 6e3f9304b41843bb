#![allow(dead_code)]

pub mod harness;
pub mod http_utils;
pub mod net;
pub mod upstream;

pub use harness::ProxyHarness;
pub use http_utils::{HttpResponse, send_raw};
pub use net::find_free_port;
pub use upstream::TestUpstream;
