use std::rc::Rc;

use log::{debug, warn};
use rusb::{Context, Device, DeviceHandle, UsbContext};
use thiserror::Error;

use crate::host::{
    Candidate, CandidateIter, ConfigDescriptor, DeviceControl, Direction, EndpointInfo, HostError,
    InterfaceControl, InterfaceMatch, Plugin, TransferKind, UsbHost, UsbId,
};

#[derive(Error, Debug)]
#[error("device is not open")]
struct NotOpen;

/// Host backend over libusb.
///
/// Exclusive-access contention surfaces here as `LIBUSB_ERROR_BUSY`, or as
/// `LIBUSB_ERROR_ACCESS` on hosts that hold matching devices captive; both
/// are mapped to [HostError::ExclusiveAccess] so the retry loop treats them
/// as "come back later".
pub struct NativeHost {
    context: Context,
}

impl NativeHost {
    pub fn new() -> Result<Self, HostError> {
        let context =
            Context::new().map_err(|e| HostError::service("creating libusb context", e))?;
        Ok(NativeHost { context })
    }
}

/// One pass over the bus, keeping the devices whose descriptor matches `id`.
fn scan(context: &Context, id: UsbId) -> Result<Vec<Device<Context>>, HostError> {
    let list = context
        .devices()
        .map_err(|e| HostError::service("listing devices", e))?;

    let mut found = Vec::new();
    for device in list.iter() {
        match device.device_descriptor() {
            Ok(descriptor)
                if descriptor.vendor_id() == id.vid && descriptor.product_id() == id.pid =>
            {
                found.push(device)
            }
            Ok(_) => {}
            Err(e) => debug!("skipping device with unreadable descriptor: {e}"),
        }
    }
    Ok(found)
}

impl UsbHost for NativeHost {
    type Device = NativeDevice;
    type Interface = NativeInterface;
    type DeviceCandidate = NativeDeviceCandidate;
    type DevicePlugin = NativeDevicePlugin;
    type InterfaceCandidate = NativeInterfaceCandidate;
    type InterfacePlugin = NativeInterfacePlugin;
    type DeviceIter = NativeDeviceIter;
    type InterfaceIter = NativeInterfaceIter;

    fn devices_matching(&self, id: UsbId) -> Result<NativeDeviceIter, HostError> {
        let queue = scan(&self.context, id)?;
        Ok(NativeDeviceIter {
            context: self.context.clone(),
            id,
            queue,
            pos: 0,
        })
    }

    fn interfaces_matching(&self, spec: InterfaceMatch) -> Result<NativeInterfaceIter, HostError> {
        let mut items = Vec::new();
        for device in scan(&self.context, spec.id)? {
            let handle = match device.open() {
                Ok(handle) => Rc::new(handle),
                Err(e) => {
                    debug!("skipping device we could not open: {e}");
                    continue;
                }
            };

            // Interface matching trusts the requested configuration to be the
            // active one; apply it best-effort when it is not.
            match handle.active_configuration() {
                Ok(active) if active == spec.configuration => {}
                _ => {
                    if let Err(e) = handle.set_active_configuration(spec.configuration) {
                        debug!("could not apply configuration {}: {e}", spec.configuration);
                    }
                }
            }

            let config = match device.active_config_descriptor() {
                Ok(config) => config,
                Err(e) => {
                    debug!("skipping device with unreadable configuration: {e}");
                    continue;
                }
            };
            for interface in config.interfaces() {
                if interface.number() == spec.interface_number {
                    items.push(NativeInterfaceCandidate {
                        device: device.clone(),
                        handle: Rc::clone(&handle),
                        number: interface.number(),
                    });
                }
            }
        }
        Ok(NativeInterfaceIter { items, pos: 0 })
    }
}

pub struct NativeDeviceIter {
    context: Context,
    id: UsbId,
    queue: Vec<Device<Context>>,
    pos: usize,
}

impl CandidateIter for NativeDeviceIter {
    type Candidate = NativeDeviceCandidate;

    fn next(&mut self) -> Option<NativeDeviceCandidate> {
        let device = self.queue.get(self.pos)?.clone();
        self.pos += 1;
        Some(NativeDeviceCandidate { device })
    }

    fn reset(&mut self) {
        // A fresh scan rather than a rewind: devices may have re-enumerated
        // while we slept, and a stale libusb reference would miss them.
        match scan(&self.context, self.id) {
            Ok(queue) => self.queue = queue,
            Err(e) => {
                warn!("could not re-enumerate devices: {e}");
                self.queue.clear();
            }
        }
        self.pos = 0;
    }
}

#[derive(Copy, Clone, Debug)]
struct CachedDescriptor {
    id: UsbId,
    release: u16,
    configurations: u8,
}

pub struct NativeDeviceCandidate {
    device: Device<Context>,
}

impl Candidate for NativeDeviceCandidate {
    type Plugin = NativeDevicePlugin;

    fn create_plugin(&self) -> Result<NativeDevicePlugin, HostError> {
        // The descriptor is read once here; everything downstream works from
        // the snapshot.
        let descriptor = self
            .device
            .device_descriptor()
            .map_err(|e| HostError::service("creating device plugin", e))?;
        let version = descriptor.device_version();

        Ok(NativeDevicePlugin {
            device: self.device.clone(),
            cached: CachedDescriptor {
                id: UsbId {
                    vid: descriptor.vendor_id(),
                    pid: descriptor.product_id(),
                },
                release: ((version.major() as u16) << 8)
                    | ((version.minor() as u16) << 4)
                    | version.sub_minor() as u16,
                configurations: descriptor.num_configurations(),
            },
        })
    }

    fn release(self) {}
}

pub struct NativeDevicePlugin {
    device: Device<Context>,
    cached: CachedDescriptor,
}

impl Plugin for NativeDevicePlugin {
    type Control = NativeDevice;

    fn query_control(&self) -> Result<NativeDevice, HostError> {
        Ok(NativeDevice {
            device: self.device.clone(),
            cached: self.cached,
            handle: None,
        })
    }

    fn destroy(self) {}
}

pub struct NativeDevice {
    device: Device<Context>,
    cached: CachedDescriptor,
    handle: Option<Rc<DeviceHandle<Context>>>,
}

impl DeviceControl for NativeDevice {
    type InterfaceIter = NativeInterfaceIter;

    fn usb_id(&self) -> Result<UsbId, HostError> {
        Ok(self.cached.id)
    }

    fn release_number(&self) -> Result<u16, HostError> {
        Ok(self.cached.release)
    }

    fn num_configurations(&self) -> Result<u8, HostError> {
        Ok(self.cached.configurations)
    }

    fn config_descriptor(&self, index: u8) -> Result<ConfigDescriptor, HostError> {
        let config = self
            .device
            .config_descriptor(index)
            .map_err(|e| HostError::service("reading configuration descriptor", e))?;
        Ok(ConfigDescriptor {
            value: config.number(),
            num_interfaces: config.num_interfaces(),
        })
    }

    fn open(&mut self) -> Result<(), HostError> {
        match self.device.open() {
            Ok(handle) => {
                self.handle = Some(Rc::new(handle));
                Ok(())
            }
            Err(rusb::Error::Busy | rusb::Error::Access) => Err(HostError::ExclusiveAccess),
            Err(e) => Err(HostError::service("opening device", e)),
        }
    }

    fn close(&mut self) {
        self.handle = None;
    }

    fn set_configuration(&mut self, value: u8) -> Result<(), HostError> {
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| HostError::service("setting configuration", NotOpen))?;

        // Skip the call when the host already made this configuration
        // active; some devices stall on a redundant SET_CONFIGURATION.
        if let Ok(active) = handle.active_configuration() {
            if active == value {
                debug!("configuration {value} already active");
                return Ok(());
            }
        }

        handle
            .set_active_configuration(value)
            .map_err(|e| HostError::service("setting configuration", e))
    }

    fn interfaces(&self) -> Result<NativeInterfaceIter, HostError> {
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| HostError::service("creating interface iterator", NotOpen))?;

        let config = self
            .device
            .active_config_descriptor()
            .map_err(|e| HostError::service("creating interface iterator", e))?;

        let items = config
            .interfaces()
            .map(|interface| NativeInterfaceCandidate {
                device: self.device.clone(),
                handle: Rc::clone(handle),
                number: interface.number(),
            })
            .collect();
        Ok(NativeInterfaceIter { items, pos: 0 })
    }

    fn release(self) {}
}

pub struct NativeInterfaceIter {
    items: Vec<NativeInterfaceCandidate>,
    pos: usize,
}

impl CandidateIter for NativeInterfaceIter {
    type Candidate = NativeInterfaceCandidate;

    fn next(&mut self) -> Option<NativeInterfaceCandidate> {
        let item = self.items.get(self.pos)?.clone();
        self.pos += 1;
        Some(item)
    }

    fn reset(&mut self) {
        self.pos = 0;
    }
}

#[derive(Clone)]
pub struct NativeInterfaceCandidate {
    device: Device<Context>,
    handle: Rc<DeviceHandle<Context>>,
    number: u8,
}

impl Candidate for NativeInterfaceCandidate {
    type Plugin = NativeInterfacePlugin;

    fn create_plugin(&self) -> Result<NativeInterfacePlugin, HostError> {
        Ok(NativeInterfacePlugin {
            device: self.device.clone(),
            handle: Rc::clone(&self.handle),
            number: self.number,
        })
    }

    fn release(self) {}
}

pub struct NativeInterfacePlugin {
    device: Device<Context>,
    handle: Rc<DeviceHandle<Context>>,
    number: u8,
}

impl Plugin for NativeInterfacePlugin {
    type Control = NativeInterface;

    fn query_control(&self) -> Result<NativeInterface, HostError> {
        Ok(NativeInterface {
            device: self.device.clone(),
            handle: Rc::clone(&self.handle),
            number: self.number,
            claimed: false,
            detached: false,
        })
    }

    fn destroy(self) {}
}

pub struct NativeInterface {
    device: Device<Context>,
    handle: Rc<DeviceHandle<Context>>,
    number: u8,
    claimed: bool,
    detached: bool,
}

impl InterfaceControl for NativeInterface {
    fn open(&mut self) -> Result<(), HostError> {
        // A kernel driver bound to the interface makes the claim fail;
        // displace it first and put it back on close.
        match self.handle.kernel_driver_active(self.number) {
            Ok(true) => match self.handle.detach_kernel_driver(self.number) {
                Ok(()) => {
                    debug!("detached kernel driver from interface {}", self.number);
                    self.detached = true;
                }
                Err(e) => warn!(
                    "could not detach kernel driver from interface {}: {e}",
                    self.number
                ),
            },
            Ok(false) => {}
            Err(e) => debug!(
                "could not check kernel driver status for interface {}: {e}",
                self.number
            ),
        }

        match self.handle.claim_interface(self.number) {
            Ok(()) => {
                self.claimed = true;
                Ok(())
            }
            Err(rusb::Error::Busy | rusb::Error::Access) => Err(HostError::ExclusiveAccess),
            Err(e) => Err(HostError::service("claiming interface", e)),
        }
    }

    fn close(&mut self) {
        if self.claimed {
            if let Err(e) = self.handle.release_interface(self.number) {
                warn!("could not release interface {}: {e}", self.number);
            }
            self.claimed = false;
        }
        if self.detached {
            if let Err(e) = self.handle.attach_kernel_driver(self.number) {
                debug!(
                    "could not reattach kernel driver to interface {}: {e}",
                    self.number
                );
            }
            self.detached = false;
        }
    }

    fn endpoints(&self) -> Result<Vec<EndpointInfo>, HostError> {
        let config = self
            .device
            .active_config_descriptor()
            .map_err(|e| HostError::service("reading endpoint properties", e))?;

        let mut endpoints = Vec::new();
        for interface in config.interfaces() {
            if interface.number() != self.number {
                continue;
            }
            // Current alternate setting handling is out of scope; report the
            // first setting's endpoints.
            if let Some(descriptor) = interface.descriptors().next() {
                for endpoint in descriptor.endpoint_descriptors() {
                    endpoints.push(EndpointInfo {
                        number: endpoint.address() & 0x0f,
                        direction: map_direction(endpoint.direction()),
                        transfer: map_transfer(endpoint.transfer_type()),
                        max_packet_size: endpoint.max_packet_size(),
                        interval: endpoint.interval(),
                    });
                }
            }
        }
        Ok(endpoints)
    }

    fn release(self) {}
}

fn map_direction(direction: rusb::Direction) -> Direction {
    match direction {
        rusb::Direction::Out => Direction::Out,
        rusb::Direction::In => Direction::In,
    }
}

fn map_transfer(transfer: rusb::TransferType) -> TransferKind {
    match transfer {
        rusb::TransferType::Control => TransferKind::Control,
        rusb::TransferType::Isochronous => TransferKind::Isochronous,
        rusb::TransferType::Bulk => TransferKind::Bulk,
        rusb::TransferType::Interrupt => TransferKind::Interrupt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_direction() {
        assert_eq!(map_direction(rusb::Direction::Out), Direction::Out);
        assert_eq!(map_direction(rusb::Direction::In), Direction::In);
    }

    #[test]
    fn test_map_transfer() {
        assert_eq!(map_transfer(rusb::TransferType::Control), TransferKind::Control);
        assert_eq!(
            map_transfer(rusb::TransferType::Isochronous),
            TransferKind::Isochronous
        );
        assert_eq!(map_transfer(rusb::TransferType::Bulk), TransferKind::Bulk);
        assert_eq!(
            map_transfer(rusb::TransferType::Interrupt),
            TransferKind::Interrupt
        );
    }
}
