use std::thread::sleep;
use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;

use crate::host::{CandidateIter, ControlOf, DeviceControl, HostError};
use crate::promote;
use crate::stop::StopToken;

/// How many enumeration passes to make over a contended device, and how long
/// to wait between them. Sleeps happen between passes only: `passes` passes
/// means `passes - 1` sleeps when contention never clears.
#[derive(Copy, Clone, Debug)]
pub struct RetryPolicy {
    pub passes: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            passes: 5,
            delay: Duration::from_secs(1),
        }
    }
}

/// Ways an acquisition can end without a device in hand.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AcquireError {
    #[error("unable to find a matching USB device")]
    NoDevices,

    #[error("no device could be acquired after {passes} enumeration passes")]
    Exhausted { passes: u32 },

    #[error("stop requested before a device was acquired")]
    Stopped,
}

impl AcquireError {
    /// Negative process exit code for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            AcquireError::NoDevices => -1,
            AcquireError::Exhausted { .. } => -2,
            AcquireError::Stopped => -3,
        }
    }
}

/// What one open attempt on a device came to. A three-way split: contention
/// is the only outcome worth retrying.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OpenOutcome {
    /// Exclusive open succeeded. Carries the `bConfigurationValue` of the
    /// device's single configuration; zero means the device is open but
    /// unusable.
    Opened { configuration: u8 },
    /// Another client holds the device. It may let go; come back later.
    Contended,
    /// Wrong shape or a failed host call. Retrying cannot fix this device.
    Failed,
}

/// Check a device's configuration shape and attempt the exclusive open.
///
/// The device must have exactly one configuration; anything else is not the
/// device we were asked for. Failures are logged here and reported only
/// through the outcome.
pub fn open_device<D: DeviceControl>(device: &mut D) -> OpenOutcome {
    let configurations = match device.num_configurations() {
        Ok(n) => n,
        Err(e) => {
            warn!("could not get number of configurations from device: {e}");
            return OpenOutcome::Failed;
        }
    };
    if configurations != 1 {
        warn!(
            "this does not look like the right device, it has {configurations} configurations (we want 1)"
        );
        return OpenOutcome::Failed;
    }

    let descriptor = match device.config_descriptor(0) {
        Ok(descriptor) => descriptor,
        Err(e) => {
            warn!("could not get configuration descriptor from device: {e}");
            return OpenOutcome::Failed;
        }
    };
    debug!("configuration value is {}", descriptor.value);

    match device.open() {
        Ok(()) => OpenOutcome::Opened {
            configuration: descriptor.value,
        },
        Err(HostError::ExclusiveAccess) => {
            debug!("exclusive error opening device, we may come back to this later");
            OpenOutcome::Contended
        }
        Err(e) => {
            warn!("could not open device: {e}");
            OpenOutcome::Failed
        }
    }
}

/// Walk matching device candidates until one is exclusively acquired, then
/// hand it to `use_device` along with its configuration value.
///
/// A pass where every failure was exclusive-access contention is retried
/// after `policy.delay`, on a fully rewound iterator, up to `policy.passes`
/// passes; any other kind of pass ends the search, since retrying cannot fix
/// fatal failures or wrong-shape devices. The first successfully opened
/// device stops the search, even when its configuration value is zero and
/// `use_device` is skipped.
///
/// `stop` is checked at the start of every pass and before every retry delay.
pub fn acquire_device<I, F>(
    candidates: &mut I,
    policy: &RetryPolicy,
    stop: &StopToken,
    mut use_device: F,
) -> Result<(), AcquireError>
where
    I: CandidateIter,
    ControlOf<I::Candidate>: DeviceControl,
    F: FnMut(&mut ControlOf<I::Candidate>, u8),
{
    for pass in 1..=policy.passes {
        if pass > 1 {
            if stop.is_requested() {
                return Err(AcquireError::Stopped);
            }
            sleep(policy.delay);
            candidates.reset();
            info!("trying open again, pass {pass}");
        }
        if stop.is_requested() {
            return Err(AcquireError::Stopped);
        }

        let mut contended: u32 = 0;
        let mut yielded_any = false;

        while let Some(candidate) = candidates.next() {
            yielded_any = true;

            let Some(mut device) = promote::device_control(candidate) else {
                continue;
            };

            match open_device(&mut device) {
                OpenOutcome::Contended => {
                    contended += 1;
                    device.release();
                }
                OpenOutcome::Failed => {
                    device.release();
                }
                OpenOutcome::Opened { configuration } => {
                    if configuration > 0 {
                        use_device(&mut device, configuration);
                    } else {
                        info!("device reports configuration value 0, nothing to use");
                    }
                    device.close();
                    device.release();
                    // First successfully used device wins; stop enumerating.
                    return Ok(());
                }
            }
        }

        if !yielded_any {
            return Err(AcquireError::NoDevices);
        }
        if contended == 0 {
            // Nothing was contended: enumeration is simply exhausted.
            return Err(AcquireError::Exhausted { passes: pass });
        }
    }

    Err(AcquireError::Exhausted {
        passes: policy.passes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeDevice, FakeHost, FakeInterface};
    use crate::host::{UsbHost, UsbId};

    const ID: UsbId = UsbId {
        vid: 2751,
        pid: 1001,
    };

    fn fast() -> RetryPolicy {
        RetryPolicy {
            passes: 5,
            delay: Duration::from_millis(0),
        }
    }

    #[test]
    fn test_all_contended_makes_every_pass_then_exhausts() {
        let host = FakeHost::new(vec![FakeDevice::new(ID).contended()]);
        let mut iter = host.devices_matching(ID).unwrap();

        let mut used = 0;
        let result = acquire_device(&mut iter, &fast(), &StopToken::new(), |_, _| used += 1);

        assert_eq!(result, Err(AcquireError::Exhausted { passes: 5 }));
        assert_eq!(used, 0);

        let ledger = host.ledger();
        assert_eq!(ledger.device_open_attempts, 5);
        // Sleep and reset are paired; 5 passes means 4 of each.
        assert_eq!(ledger.resets, 4);
        assert!(ledger.balanced(), "unbalanced handles: {ledger:?}");
    }

    #[test]
    fn test_first_success_touches_nothing_else() {
        let host = FakeHost::new(vec![
            FakeDevice::new(ID).with_interfaces(vec![FakeInterface::new(0)]),
            FakeDevice::new(ID).contended(),
        ]);
        let mut iter = host.devices_matching(ID).unwrap();

        let mut configurations = Vec::new();
        let result = acquire_device(&mut iter, &fast(), &StopToken::new(), |_, configuration| {
            configurations.push(configuration)
        });

        assert_eq!(result, Ok(()));
        assert_eq!(configurations, vec![1]);

        let ledger = host.ledger();
        assert_eq!(ledger.candidates_yielded, 1);
        assert_eq!(ledger.resets, 0);
        assert_eq!(ledger.device_open_attempts, 1);
        assert_eq!(ledger.device_closes, 1);
        assert!(ledger.balanced(), "unbalanced handles: {ledger:?}");
    }

    #[test]
    fn test_fatal_only_pass_does_not_retry() {
        let host = FakeHost::new(vec![
            FakeDevice::new(ID).open_fails(),
            FakeDevice::new(ID).with_configurations(2),
        ]);
        let mut iter = host.devices_matching(ID).unwrap();

        let result = acquire_device(&mut iter, &fast(), &StopToken::new(), |_, _| {});

        assert_eq!(result, Err(AcquireError::Exhausted { passes: 1 }));
        assert_eq!(host.ledger().resets, 0);
        assert!(host.ledger().balanced());
    }

    #[test]
    fn test_contention_clearing_mid_retry_succeeds() {
        let host = FakeHost::new(vec![FakeDevice::new(ID).contended_for(2)]);
        let mut iter = host.devices_matching(ID).unwrap();

        let mut used = 0;
        let result = acquire_device(&mut iter, &fast(), &StopToken::new(), |_, _| used += 1);

        assert_eq!(result, Ok(()));
        assert_eq!(used, 1);

        let ledger = host.ledger();
        assert_eq!(ledger.device_open_attempts, 3);
        assert_eq!(ledger.resets, 2);
        assert!(ledger.balanced(), "unbalanced handles: {ledger:?}");
    }

    #[test]
    fn test_wrong_configuration_count_is_never_opened() {
        let host = FakeHost::new(vec![FakeDevice::new(ID).with_configurations(2)]);
        let mut iter = host.devices_matching(ID).unwrap();

        let result = acquire_device(&mut iter, &fast(), &StopToken::new(), |_, _| {});

        assert_eq!(result, Err(AcquireError::Exhausted { passes: 1 }));
        assert_eq!(host.ledger().device_open_attempts, 0);
        assert!(host.ledger().balanced());
    }

    #[test]
    fn test_zero_configuration_ends_search_without_use() {
        let host = FakeHost::new(vec![
            FakeDevice::new(ID).with_configuration_value(0),
            FakeDevice::new(ID),
        ]);
        let mut iter = host.devices_matching(ID).unwrap();

        let mut used = 0;
        let result = acquire_device(&mut iter, &fast(), &StopToken::new(), |_, _| used += 1);

        // Successfully opened, nothing to use, but the search is over.
        assert_eq!(result, Ok(()));
        assert_eq!(used, 0);

        let ledger = host.ledger();
        assert_eq!(ledger.candidates_yielded, 1);
        assert_eq!(ledger.device_closes, 1);
        assert!(ledger.balanced(), "unbalanced handles: {ledger:?}");
    }

    #[test]
    fn test_failed_promotion_moves_to_next_candidate() {
        let host = FakeHost::new(vec![FakeDevice::new(ID).plugin_fails(), FakeDevice::new(ID)]);
        let mut iter = host.devices_matching(ID).unwrap();

        let mut used = 0;
        let result = acquire_device(&mut iter, &fast(), &StopToken::new(), |_, _| used += 1);

        assert_eq!(result, Ok(()));
        assert_eq!(used, 1);

        let ledger = host.ledger();
        assert_eq!(ledger.candidates_yielded, 2);
        assert_eq!(ledger.candidates_released, 2);
        assert!(ledger.balanced(), "unbalanced handles: {ledger:?}");
    }

    #[test]
    fn test_empty_enumeration_reports_no_devices() {
        let host = FakeHost::new(vec![]);
        let mut iter = host.devices_matching(ID).unwrap();

        let result = acquire_device(&mut iter, &fast(), &StopToken::new(), |_, _| {});

        assert_eq!(result, Err(AcquireError::NoDevices));
    }

    #[test]
    fn test_stop_request_wins_over_enumeration() {
        let host = FakeHost::new(vec![FakeDevice::new(ID)]);
        let mut iter = host.devices_matching(ID).unwrap();

        let stop = StopToken::new();
        stop.request();
        let result = acquire_device(&mut iter, &fast(), &stop, |_, _| {});

        assert_eq!(result, Err(AcquireError::Stopped));
        assert_eq!(host.ledger().candidates_yielded, 0);
    }

    #[test]
    fn test_exit_codes_are_negative_and_distinct() {
        let codes = [
            AcquireError::NoDevices.exit_code(),
            AcquireError::Exhausted { passes: 5 }.exit_code(),
            AcquireError::Stopped.exit_code(),
        ];
        assert!(codes.iter().all(|&c| c < 0));
        assert_eq!(codes, [-1, -2, -3]);
    }
}
