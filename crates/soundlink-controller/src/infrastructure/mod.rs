//! Infrastructure layer for the controller application.
//!
//! - **`network`** – the control-channel client: connection status machine,
//!   bounded outbound queue, ping correlation, and reconnect policy.
//! - **`transfer`** – the upload sender for the transfer port.
//! - **`discovery`** – the UDP browser that finds servers on the LAN.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `soundlink_core`, but MUST NOT be imported by the `application` layer.

pub mod discovery;
pub mod network;
pub mod transfer;
