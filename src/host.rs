use std::fmt::Display;
use thiserror::Error;

/// A USB vendor ID and product ID pair.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UsbId {
    pub vid: u16,
    pub pid: u16,
}

impl Display for UsbId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vid, self.pid)
    }
}

/// Criteria for matching an interface directly, without walking its device
/// first. The configuration value and interface number pin down one interface
/// per matching device.
#[derive(Copy, Clone, Debug)]
pub struct InterfaceMatch {
    pub id: UsbId,
    pub configuration: u8,
    pub interface_number: u8,
}

/// The slice of a configuration descriptor the acquisition logic cares about.
#[derive(Copy, Clone, Debug)]
pub struct ConfigDescriptor {
    /// `bConfigurationValue`; what `set_configuration` expects. May be zero,
    /// which the host considers valid but nothing can use.
    pub value: u8,
    pub num_interfaces: u8,
}

/// Endpoint transfer types.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl Display for TransferKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            TransferKind::Control => write!(f, "control"),
            TransferKind::Isochronous => write!(f, "isochronous"),
            TransferKind::Bulk => write!(f, "bulk"),
            TransferKind::Interrupt => write!(f, "interrupt"),
        }
    }
}

/// Endpoint direction, seen from the host.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    Out,
    In,
}

impl Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Direction::Out => write!(f, "out"),
            Direction::In => write!(f, "in"),
        }
    }
}

/// Properties of one endpoint of an opened interface. Diagnostic only; the
/// acquisition loop never branches on these.
#[derive(Copy, Clone, Debug)]
pub struct EndpointInfo {
    pub number: u8,
    pub direction: Direction,
    pub transfer: TransferKind,
    pub max_packet_size: u16,
    pub interval: u8,
}

/// Failures reported by the host USB service layer.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HostError {
    /// An open attempt failed specifically because another client currently
    /// owns the device. Retry-eligible; everything else is not.
    #[error("another client holds the device for exclusive access")]
    ExclusiveAccess,

    #[error("host service call failed while {action}")]
    Service {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
        action: &'static str,
    },
}

impl HostError {
    /// Wrap a backend error, tagged with the call that failed.
    pub fn service(
        action: &'static str,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        HostError::Service {
            source: Box::new(source),
            action,
        }
    }
}

/// A restartable stream of candidate service handles produced by a matching
/// query. Not a [std::iter::Iterator]: a retry pass needs [reset](Self::reset),
/// a full rewind to the first candidate, so that previously-contended
/// candidates are seen again.
pub trait CandidateIter {
    type Candidate: Candidate;

    fn next(&mut self) -> Option<Self::Candidate>;

    /// Rewind to the first candidate. Merely resuming is not enough: a device
    /// that was contended earlier in the pass may have become free.
    fn reset(&mut self);
}

/// An opaque, not-yet-owned reference to a host-enumerated device or
/// interface. Yielded by a [CandidateIter]; promoted to a control object or
/// released, never both.
pub trait Candidate {
    type Plugin: Plugin;

    /// Create the intermediate plugin object scoped to this candidate.
    fn create_plugin(&self) -> Result<Self::Plugin, HostError>;

    /// Hand the reference back to the host.
    fn release(self);
}

/// The short-lived intermediate object between a candidate and its control
/// object. Lives only for the duration of a single [query](Self::query_control)
/// and is destroyed unconditionally afterward.
pub trait Plugin {
    type Control;

    fn query_control(&self) -> Result<Self::Control, HostError>;

    fn destroy(self);
}

/// The control object produced by promoting candidate `C`.
pub type ControlOf<C> = <<C as Candidate>::Plugin as Plugin>::Control;

/// The interface control type reachable from device control `D`.
pub type InterfaceOf<D> =
    ControlOf<<<D as DeviceControl>::InterfaceIter as CandidateIter>::Candidate>;

/// An owned, operable handle to a device. Exactly one
/// [release](Self::release) per object; [close](Self::close) only after a
/// successful [open](Self::open).
pub trait DeviceControl {
    type InterfaceIter: CandidateIter;

    fn usb_id(&self) -> Result<UsbId, HostError>;

    /// The device's BCD release number.
    fn release_number(&self) -> Result<u16, HostError>;

    fn num_configurations(&self) -> Result<u8, HostError>;

    fn config_descriptor(&self, index: u8) -> Result<ConfigDescriptor, HostError>;

    /// Take exclusive ownership of the device. Fails with
    /// [HostError::ExclusiveAccess] when another client already holds it.
    fn open(&mut self) -> Result<(), HostError>;

    fn close(&mut self);

    /// Make `value` the active configuration. Must tolerate being a no-op
    /// when that configuration is already active.
    fn set_configuration(&mut self, value: u8) -> Result<(), HostError>;

    /// Enumerate every interface of the active configuration ("don't care"
    /// filter on class, subclass, protocol and alternate setting). Only valid
    /// on an opened, configured device.
    fn interfaces(&self) -> Result<Self::InterfaceIter, HostError>;

    fn release(self);
}

/// An owned, operable handle to one interface of an opened device.
pub trait InterfaceControl {
    /// Claim the interface for I/O.
    fn open(&mut self) -> Result<(), HostError>;

    fn close(&mut self);

    fn endpoints(&self) -> Result<Vec<EndpointInfo>, HostError>;

    fn release(self);
}

/// One host USB backend: the handle family plus the matching queries
/// everything starts from.
pub trait UsbHost {
    type Device: DeviceControl<InterfaceIter = Self::InterfaceIter>;
    type Interface: InterfaceControl;
    type DeviceCandidate: Candidate<Plugin = Self::DevicePlugin>;
    type DevicePlugin: Plugin<Control = Self::Device>;
    type InterfaceCandidate: Candidate<Plugin = Self::InterfacePlugin>;
    type InterfacePlugin: Plugin<Control = Self::Interface>;
    type DeviceIter: CandidateIter<Candidate = Self::DeviceCandidate>;
    type InterfaceIter: CandidateIter<Candidate = Self::InterfaceCandidate>;

    /// Enumerate devices matching a vendor/product pair.
    fn devices_matching(&self, id: UsbId) -> Result<Self::DeviceIter, HostError>;

    /// Enumerate matching interfaces directly, skipping device acquisition.
    fn interfaces_matching(&self, spec: InterfaceMatch)
    -> Result<Self::InterfaceIter, HostError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usb_id_display() {
        let id = UsbId {
            vid: 0x0abf,
            pid: 0x03e9,
        };
        assert_eq!(id.to_string(), "0abf:03e9");
    }

    #[test]
    fn test_host_error_display() {
        let err = HostError::service("opening device", std::io::Error::other("no bus"));
        assert_eq!(err.to_string(), "host service call failed while opening device");

        assert_eq!(
            HostError::ExclusiveAccess.to_string(),
            "another client holds the device for exclusive access"
        );
    }
}
