//! Instrument models.
//!
//! An instrument is a thin domain layer over a [`RegisterDevice`]: its setters
//! validate physical units and stage attribute values, and the [`Instrument`]
//! trait supplies the commit and frame plumbing shared by every type.
//!
//! # Commit flow
//!
//! ```text
//! setter ─▶ validate ─▶ stage ─▶ commit()
//!                                  │ calculate_scales()
//!                                  │ recompute_dependent_registers(scales)
//!                                  ▼
//!                       RegisterDevice::commit(scales, derived)
//! ```
//!
//! Instruments compose capability helpers ([`OscilloscopeCore`],
//! [`DecFilter`]) rather than inheriting behaviour.

pub mod dec_filter;
pub mod iir_filter_box;
pub mod oscilloscope;

use std::time::Duration;

use tracing::info;

use crate::commit::{CommitState, RegisterDevice};
use crate::config::DeviceConfig;
use crate::error::AppResult;
use crate::frame::Frame;
use crate::scales::ScaleState;

pub use crate::commit::BASE_REGISTERS;
pub use dec_filter::DecFilter;
pub use iir_filter_box::IirFilterBox;
pub use oscilloscope::{Oscilloscope, OscilloscopeCore};

/// Common contract of every instrument type.
pub trait Instrument {
    /// Instrument type id loaded onto the device.
    fn id(&self) -> u8;

    fn name(&self) -> &'static str;

    fn config(&self) -> &DeviceConfig;

    fn device(&self) -> &RegisterDevice;

    fn device_mut(&mut self) -> &mut RegisterDevice;

    /// Stage the power-on configuration. Does not commit.
    fn set_defaults(&mut self) -> AppResult<()>;

    /// Scale state implied by the currently staged settings.
    fn calculate_scales(&self) -> AppResult<ScaleState>;

    /// Values of registers computed from instrument state at commit time.
    fn recompute_dependent_registers(&self, _scales: &ScaleState) -> Vec<(&'static str, f64)> {
        Vec::new()
    }

    /// Send staged and derived changes to the device.
    fn commit(&mut self) -> AppResult<()> {
        let scales = self.calculate_scales()?;
        let derived = self.recompute_dependent_registers(&scales);
        self.device_mut().commit(&scales, &derived)
    }

    /// Wait for the next frame; `None` uses the configured timeout.
    fn get_frame(&mut self, timeout: Option<Duration>) -> AppResult<Frame> {
        let timeout = timeout.unwrap_or_else(|| self.config().frame_timeout());
        self.device_mut().acquire_frame(timeout)
    }

    fn commit_state(&self) -> CommitState {
        self.device().state()
    }

    /// Refresh instrument state held outside the register map from the
    /// device image. Called at the end of [`Instrument::sync`].
    fn reload_from_registers(&mut self) -> AppResult<()> {
        Ok(())
    }

    /// Re-read the device registers, discarding staged changes.
    ///
    /// Scale-dependent values are decoded twice: once to read back the
    /// settings the scale state derives from, then again under that state.
    fn sync(&mut self) -> AppResult<()> {
        let provisional = self.calculate_scales()?;
        self.device_mut().sync(&provisional)?;
        let scales = self.calculate_scales()?;
        self.device_mut().rescale(&scales);
        self.reload_from_registers()
    }
}

/// Check the device against the configured compatibility lists, apply the
/// instrument defaults and commit them.
pub fn attach<I: Instrument + ?Sized>(instrument: &mut I) -> AppResult<()> {
    let info = instrument.device_mut().device_info()?;
    instrument.config().check_compatibility(&info)?;
    info!(
        instrument = instrument.name(),
        id = instrument.id(),
        firmware = info.firmware_build,
        "attaching instrument"
    );
    instrument.set_defaults()?;
    instrument.commit()
}
