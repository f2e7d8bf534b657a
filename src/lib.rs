//! Host-side register transaction and scaling engine for FPGA instruments.
//!
//! This library translates typed instrument settings (volts, gains, filter
//! coefficients) into fixed-point register writes, batches them into atomic
//! commits, and decodes captured frames back into calibrated units using the
//! scale state that was active when each frame was acquired.
//!
//! ```text
//! Instrument setter ─▶ RegisterMap::stage ─▶ commit ─▶ Transport::write_registers
//!                                                        │
//! VoltsData ◀─ Frame::decode ◀─ ScaleState (by state id) ◀┘ Transport::get_frame
//! ```
//!
//! # Example
//!
//! ```
//! use rust_moku::config::DeviceConfig;
//! use rust_moku::instruments::{attach, IirFilterBox, Instrument};
//! use rust_moku::transport::MockTransport;
//!
//! let transport = MockTransport::new();
//! let mut iir = IirFilterBox::new(Box::new(transport.clone()), DeviceConfig::default()).unwrap();
//! attach(&mut iir).unwrap();
//!
//! iir.set_control_matrix(1, 1.0, 0.5).unwrap();
//! iir.commit().unwrap();
//! ```

pub mod channel;
pub mod codec;
pub mod commit;
pub mod config;
pub mod error;
pub mod frame;
pub mod instruments;
pub mod logging;
pub mod payload;
pub mod register_map;
pub mod scales;
pub mod transport;
pub mod validation;

pub use channel::Channel;
pub use error::{AppResult, MokuError};
