//! D-Bus access to the service manager.
//!
//! Uses blocking zbus proxies on the system bus. Authorization for the calls
//! themselves is left to polkit on the systemd side; this server's own
//! checks happen before any call is made (see [`crate::auth`]).

pub mod systemd;

pub use systemd::SystemdBus;
