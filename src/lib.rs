//! Vitegate - a dev-time gateway in front of a frontend dev server
//!
//! This library lets a backend application and a separately running frontend
//! asset pipeline appear as one origin to the browser:
//! - Supervises the frontend tool as a process group and cleans it up on exit
//! - Discovers the tool's address through a rendezvous ("hot") file
//! - Proxies asset/HMR paths (`spa`) or everything but app routes (`ssr`)
//! - Tunnels HMR WebSockets to the tool
//! - Honors `X-Forwarded-*` headers from trusted proxies only

pub mod app;
pub mod config;
pub mod error;
pub mod forwarded;
pub mod hotfile;
pub mod pool;
pub mod proxy;
pub mod routes;
pub mod server;
pub mod supervisor;
pub mod tunnel;
