//! Protocol engines. Each submodule owns one wire format and reduces
//! it to [`HttpListener`](crate::listener::HttpListener) events going
//! in and [`Chunk`](crate::net::Chunk) sequences going out.

pub mod fastcgi;
pub mod h1;
pub mod h2;
