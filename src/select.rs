use log::{debug, warn};
use thiserror::Error;

use crate::host::{
    CandidateIter, ControlOf, DeviceControl, HostError, InterfaceControl, InterfaceOf,
};
use crate::promote;

/// Ways interface selection can end without the consumer having run.
#[derive(Error, Debug)]
pub enum SelectError {
    #[error("could not set configuration on device")]
    SetConfiguration(#[source] HostError),

    #[error("could not create interface iterator")]
    CreateIterator(#[source] HostError),

    #[error("could not open interface")]
    OpenInterface(#[source] HostError),

    #[error("unable to find any interface")]
    NoInterfaces,

    #[error("no interesting interfaces found")]
    NoneAccepted,
}

/// Picks the one interface to use out of the candidates a device offers.
///
/// Implementations may inspect endpoints, count ordinals, or match
/// vendor-specific data. State is scoped to the borrow a selection call
/// holds, so independent acquisition attempts never share decisions.
pub trait Discriminator<I> {
    fn accept(&mut self, interface: &I) -> bool;
}

/// The default policy: accept the first interface offered, reject every
/// later one.
#[derive(Debug, Default)]
pub struct FirstInterface {
    matched: bool,
}

impl<I> Discriminator<I> for FirstInterface {
    fn accept(&mut self, _interface: &I) -> bool {
        if self.matched {
            debug!("subsequent interface found, we're only interested in one of them");
            return false;
        }
        self.matched = true;
        true
    }
}

/// Accept the interface at a fixed ordinal position in enumeration order.
#[derive(Debug)]
pub struct NthInterface {
    target: usize,
    seen: usize,
}

impl NthInterface {
    pub fn new(target: usize) -> Self {
        NthInterface { target, seen: 0 }
    }
}

impl<I> Discriminator<I> for NthInterface {
    fn accept(&mut self, _interface: &I) -> bool {
        let ordinal = self.seen;
        self.seen += 1;
        ordinal == self.target
    }
}

/// Configure an opened device and run the consumer on one of its interfaces.
///
/// The configuration is set explicitly even when the host already made it
/// active; backends tolerate the no-op.
pub fn use_device<D, X, F>(
    device: &mut D,
    configuration: u8,
    discriminator: &mut X,
    consumer: F,
) -> Result<(), SelectError>
where
    D: DeviceControl,
    InterfaceOf<D>: InterfaceControl,
    X: Discriminator<InterfaceOf<D>> + ?Sized,
    F: FnMut(&mut InterfaceOf<D>),
{
    device
        .set_configuration(configuration)
        .map_err(SelectError::SetConfiguration)?;

    let mut candidates = device.interfaces().map_err(SelectError::CreateIterator)?;

    select_interface(&mut candidates, discriminator, consumer)
}

/// Walk interface candidates, let the discriminator pick exactly one, open
/// it, and hand it to the consumer.
///
/// Acceptance ends the search whether or not the open succeeds. The accepted
/// interface's endpoints are logged for diagnostics only; endpoint query
/// failures never affect the outcome. Every promoted control object is
/// released before this returns, on every path.
pub fn select_interface<I, X, F>(
    candidates: &mut I,
    discriminator: &mut X,
    mut consumer: F,
) -> Result<(), SelectError>
where
    I: CandidateIter,
    ControlOf<I::Candidate>: InterfaceControl,
    X: Discriminator<ControlOf<I::Candidate>> + ?Sized,
    F: FnMut(&mut ControlOf<I::Candidate>),
{
    let mut yielded_any = false;

    while let Some(candidate) = candidates.next() {
        yielded_any = true;

        let Some(mut interface) = promote::promote(candidate) else {
            continue;
        };

        if !discriminator.accept(&interface) {
            interface.release();
            continue;
        }

        match interface.open() {
            Ok(()) => {
                log_endpoints(&interface);
                consumer(&mut interface);
                interface.close();
                interface.release();
                return Ok(());
            }
            Err(e) => {
                warn!("could not open interface: {e}");
                interface.release();
                return Err(SelectError::OpenInterface(e));
            }
        }
    }

    if !yielded_any {
        warn!("unable to find an interface");
        return Err(SelectError::NoInterfaces);
    }
    warn!("no interesting interfaces found");
    Err(SelectError::NoneAccepted)
}

fn log_endpoints<I: InterfaceControl>(interface: &I) {
    let endpoints = match interface.endpoints() {
        Ok(endpoints) => endpoints,
        Err(e) => {
            warn!("could not get endpoint properties: {e}");
            return;
        }
    };

    debug!("{} endpoints found", endpoints.len());
    for endpoint in &endpoints {
        debug!(
            "endpoint {}: {} {}, max packet {}, interval {}",
            endpoint.number,
            endpoint.transfer,
            endpoint.direction,
            endpoint.max_packet_size,
            endpoint.interval
        );
    }
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

    /// Open a fake device the way the acquisition loop would before handing
    /// it to `use_device`.
    fn opened_device(host: &FakeHost) -> <FakeHost as UsbHost>::Device {
        let mut iter = host.devices_matching(ID).unwrap();
        let candidate = iter.next().unwrap();
        let mut device = promote::device_control(candidate).unwrap();
        device.open().unwrap();
        device
    }

    fn teardown(host: &FakeHost, device: <FakeHost as UsbHost>::Device) {
        let mut device = device;
        device.close();
        device.release();
        assert!(host.ledger().balanced(), "unbalanced: {:?}", host.ledger());
    }

    #[test]
    fn test_first_interface_wins_and_rest_are_released() {
        let host = FakeHost::new(vec![FakeDevice::new(ID).with_interfaces(vec![
            FakeInterface::new(0),
            FakeInterface::new(1),
        ])]);
        let mut device = opened_device(&host);

        let mut numbers = Vec::new();
        let result = use_device(&mut device, 1, &mut FirstInterface::default(), |interface| {
            numbers.push(interface.number())
        });

        assert!(result.is_ok());
        assert_eq!(numbers, vec![0]);

        let ledger = host.ledger();
        assert_eq!(ledger.set_configurations, vec![1]);
        assert_eq!(ledger.interface_opens, 1);
        assert_eq!(ledger.interface_closes, 1);

        teardown(&host, device);
    }

    #[test]
    fn test_nth_interface_skips_earlier_candidates() {
        let host = FakeHost::new(vec![FakeDevice::new(ID).with_interfaces(vec![
            FakeInterface::new(0),
            FakeInterface::new(1),
            FakeInterface::new(2),
        ])]);
        let mut device = opened_device(&host);

        let mut numbers = Vec::new();
        let result = use_device(&mut device, 1, &mut NthInterface::new(2), |interface| {
            numbers.push(interface.number())
        });

        assert!(result.is_ok());
        assert_eq!(numbers, vec![2]);

        teardown(&host, device);
    }

    #[test]
    fn test_rejected_interfaces_are_released() {
        struct RejectAll;
        impl<I> Discriminator<I> for RejectAll {
            fn accept(&mut self, _interface: &I) -> bool {
                false
            }
        }

        let host = FakeHost::new(vec![FakeDevice::new(ID).with_interfaces(vec![
            FakeInterface::new(0),
            FakeInterface::new(1),
        ])]);
        let mut device = opened_device(&host);

        let result = use_device(&mut device, 1, &mut RejectAll, |_| {});
        assert!(matches!(result, Err(SelectError::NoneAccepted)));

        let ledger = host.ledger();
        assert_eq!(ledger.controls_created, 3); // device + 2 interfaces
        assert_eq!(ledger.interface_opens, 0);

        teardown(&host, device);
    }

    #[test]
    fn test_accepted_but_unopenable_interface_ends_search_released() {
        let host = FakeHost::new(vec![FakeDevice::new(ID).with_interfaces(vec![
            FakeInterface::new(0).open_fails(),
            FakeInterface::new(1),
        ])]);
        let mut device = opened_device(&host);

        let mut used = 0;
        let result = use_device(&mut device, 1, &mut FirstInterface::default(), |_| used += 1);

        assert!(matches!(result, Err(SelectError::OpenInterface(_))));
        assert_eq!(used, 0);

        // Acceptance ends the search: the second interface is never promoted.
        let ledger = host.ledger();
        assert_eq!(ledger.interface_open_attempts, 1);
        assert_eq!(ledger.interface_opens, 0);

        teardown(&host, device);
    }

    #[test]
    fn test_no_interfaces_is_distinct_from_none_accepted() {
        let host = FakeHost::new(vec![FakeDevice::new(ID)]);
        let mut device = opened_device(&host);

        let result = use_device(&mut device, 1, &mut FirstInterface::default(), |_| {});
        assert!(matches!(result, Err(SelectError::NoInterfaces)));

        teardown(&host, device);
    }

    #[test]
    fn test_discriminator_state_is_per_invocation() {
        let mut accepted = Vec::new();
        for _ in 0..2 {
            let host = FakeHost::new(vec![
                FakeDevice::new(ID).with_interfaces(vec![FakeInterface::new(0)]),
            ]);
            let mut device = opened_device(&host);

            // A fresh discriminator per acquisition: no hidden process-wide
            // "already found one" flag.
            let result =
                use_device(&mut device, 1, &mut FirstInterface::default(), |interface| {
                    accepted.push(interface.number())
                });
            assert!(result.is_ok());

            teardown(&host, device);
        }
        assert_eq!(accepted, vec![0, 0]);
    }
}
