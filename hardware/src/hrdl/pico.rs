//! Pico Technology `libpicohrdl` binding.
//!
//! Thin FFI layer over the vendor shared library. All argument validation and
//! state tracking lives in [`HrdlUnit`](super::HrdlUnit); this type only
//! forwards calls and converts status codes.

use libc::{c_char, c_short};
use tracing::trace;

use super::{
    BlockMethod, ConversionTime, Handle, HrdlBackend, InfoKind, Mains, OpenStatus, Range,
};

#[link(name = "picohrdl")]
extern "C" {
    fn HRDLOpenUnit() -> c_short;
    fn HRDLOpenUnitAsync() -> c_short;
    fn HRDLOpenUnitProgress(handle: *mut c_short, progress: *mut c_short) -> c_short;
    fn HRDLGetUnitInfo(
        handle: c_short,
        string: *mut c_char,
        string_length: c_short,
        info: c_short,
    ) -> c_short;
    fn HRDLCloseUnit(handle: c_short) -> c_short;
    fn HRDLGetMinMaxAdcCounts(
        handle: c_short,
        min_adc: *mut i32,
        max_adc: *mut i32,
        channel: c_short,
    ) -> c_short;
    fn HRDLSetAnalogInChannel(
        handle: c_short,
        channel: c_short,
        enabled: c_short,
        range: c_short,
        single_ended: c_short,
    ) -> c_short;
    fn HRDLSetInterval(handle: c_short, sample_interval_ms: i32, conversion_time: c_short)
        -> c_short;
    fn HRDLRun(handle: c_short, n_values: i32, method: c_short) -> c_short;
    fn HRDLReady(handle: c_short) -> c_short;
    fn HRDLStop(handle: c_short);
    fn HRDLGetValues(
        handle: c_short,
        values: *mut i32,
        overflow: *mut c_short,
        no_of_values: i32,
    ) -> i32;
    fn HRDLGetTimesAndValues(
        handle: c_short,
        times: *mut i32,
        values: *mut i32,
        overflow: *mut c_short,
        no_of_values: i32,
    ) -> i32;
    fn HRDLSetMains(handle: c_short, sixty_hertz: c_short) -> c_short;
    fn HRDLGetNumberOfEnabledChannels(handle: c_short, n_enabled: *mut c_short) -> c_short;
}

/// Length of the buffer handed to `HRDLGetUnitInfo`.
const INFO_BUFFER_LEN: usize = 80;

/// Backend calling the installed vendor driver.
#[derive(Debug, Default)]
pub struct PicoHrdl {
    enabled_channels: i16,
}

impl PicoHrdl {
    pub fn new() -> Self {
        Self::default()
    }

    fn refresh_enabled(&mut self, handle: Handle) {
        if let Some(n) = self.enabled_channel_count(handle) {
            self.enabled_channels = n;
        }
    }
}

impl HrdlBackend for PicoHrdl {
    fn open_unit(&mut self) -> OpenStatus {
        // SAFETY: no arguments; the driver owns all state.
        let handle = unsafe { HRDLOpenUnit() };
        match handle {
            0 => OpenStatus::NoDevice,
            h if h < 0 => OpenStatus::Failed,
            h => OpenStatus::Opened(Handle(h)),
        }
    }

    fn open_unit_async(&mut self) -> bool {
        // SAFETY: no arguments.
        unsafe { HRDLOpenUnitAsync() != 0 }
    }

    fn open_unit_progress(&mut self) -> (Option<Handle>, u8) {
        let mut handle: c_short = 0;
        let mut progress: c_short = 0;
        // SAFETY: both pointers refer to live stack variables.
        let status = unsafe { HRDLOpenUnitProgress(&mut handle, &mut progress) };
        if status == 0 {
            return (None, 100);
        }
        let handle = (handle != 0).then_some(Handle(handle));
        (handle, progress.clamp(0, 100) as u8)
    }

    fn unit_info(&self, handle: Handle, kind: InfoKind) -> String {
        let mut buf = [0 as c_char; INFO_BUFFER_LEN];
        // SAFETY: the buffer length passed matches the buffer; the driver
        // writes at most that many bytes including the terminator.
        let len = unsafe {
            HRDLGetUnitInfo(
                handle.0,
                buf.as_mut_ptr(),
                INFO_BUFFER_LEN as c_short,
                kind.code(),
            )
        };
        let len = (len.max(0) as usize).min(INFO_BUFFER_LEN);
        let bytes: Vec<u8> = buf[..len]
            .iter()
            .map(|&c| c as u8)
            .take_while(|&b| b != 0)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn min_max_adc_counts(&self, handle: Handle, channel: i16) -> Option<(i32, i32)> {
        let mut min = 0i32;
        let mut max = 0i32;
        // SAFETY: both pointers refer to live stack variables.
        let status = unsafe { HRDLGetMinMaxAdcCounts(handle.0, &mut min, &mut max, channel) };
        (status != 0).then_some((min, max))
    }

    fn set_analog_in_channel(
        &mut self,
        handle: Handle,
        channel: i16,
        enabled: bool,
        range: Range,
        single_ended: bool,
    ) -> bool {
        // SAFETY: plain value arguments.
        let status = unsafe {
            HRDLSetAnalogInChannel(
                handle.0,
                channel,
                c_short::from(enabled),
                range.code(),
                c_short::from(single_ended),
            )
        };
        self.refresh_enabled(handle);
        status != 0
    }

    fn set_interval(
        &mut self,
        handle: Handle,
        sample_interval_ms: i32,
        conversion_time: ConversionTime,
    ) -> bool {
        // SAFETY: plain value arguments.
        unsafe { HRDLSetInterval(handle.0, sample_interval_ms, conversion_time.code()) != 0 }
    }

    fn set_mains(&mut self, handle: Handle, mains: Mains) -> bool {
        // SAFETY: plain value arguments.
        unsafe { HRDLSetMains(handle.0, c_short::from(mains.is_sixty_hertz())) != 0 }
    }

    fn run(&mut self, handle: Handle, n_values: i32, method: BlockMethod) -> bool {
        trace!("HRDLRun({}, {n_values}, {method:?})", handle.0);
        // SAFETY: plain value arguments.
        unsafe { HRDLRun(handle.0, n_values, method.code()) != 0 }
    }

    fn ready(&self, handle: Handle) -> bool {
        // SAFETY: plain value argument.
        unsafe { HRDLReady(handle.0) != 0 }
    }

    fn stop(&mut self, handle: Handle) {
        // SAFETY: plain value argument.
        unsafe { HRDLStop(handle.0) }
    }

    fn get_values(&mut self, handle: Handle, values: &mut [i32], n_samples: i32) -> (i32, bool) {
        let channels = self.enabled_channels.max(1) as usize;
        let n_samples = n_samples.min((values.len() / channels) as i32);
        let mut overflow: c_short = 0;
        // SAFETY: `values` holds at least `n_samples * enabled_channels`
        // entries, which is the most the driver writes.
        let count =
            unsafe { HRDLGetValues(handle.0, values.as_mut_ptr(), &mut overflow, n_samples) };
        (count, overflow != 0)
    }

    fn get_times_and_values(
        &mut self,
        handle: Handle,
        times: &mut [i32],
        values: &mut [i32],
        n_samples: i32,
    ) -> (i32, bool) {
        let channels = self.enabled_channels.max(1) as usize;
        let n_samples = n_samples
            .min((values.len() / channels) as i32)
            .min(times.len() as i32);
        let mut overflow: c_short = 0;
        // SAFETY: `times` holds `n_samples` entries and `values` holds
        // `n_samples * enabled_channels`.
        let count = unsafe {
            HRDLGetTimesAndValues(
                handle.0,
                times.as_mut_ptr(),
                values.as_mut_ptr(),
                &mut overflow,
                n_samples,
            )
        };
        (count, overflow != 0)
    }

    fn enabled_channel_count(&self, handle: Handle) -> Option<i16> {
        let mut n: c_short = 0;
        // SAFETY: pointer refers to a live stack variable.
        let status = unsafe { HRDLGetNumberOfEnabledChannels(handle.0, &mut n) };
        (status != 0).then_some(n)
    }

    fn close_unit(&mut self, handle: Handle) -> bool {
        // SAFETY: plain value argument; closing an unknown handle is reported
        // by status, not undefined behaviour.
        unsafe { HRDLCloseUnit(handle.0) != 0 }
    }
}
