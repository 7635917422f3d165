//! In-memory host backend that simulates enumeration, contention, and handle
//! lifecycles without touching real hardware. Every lifecycle event lands in
//! a shared [Ledger] so tests can assert that handles balance.

use std::cell::RefCell;
use std::rc::Rc;

use thiserror::Error;

use crate::host::{
    Candidate, CandidateIter, ConfigDescriptor, DeviceControl, EndpointInfo, HostError,
    InterfaceControl, InterfaceMatch, Plugin, UsbHost, UsbId,
};

/// Counters for every lifecycle event on fake handles. Creation and release
/// must balance on every execution path; [balanced](Self::balanced) checks
/// exactly that.
#[derive(Clone, Debug, Default)]
pub struct Ledger {
    pub candidates_yielded: usize,
    pub candidates_released: usize,
    pub plugins_created: usize,
    pub plugins_destroyed: usize,
    pub controls_created: usize,
    pub controls_released: usize,
    /// Open attempts, including contended and failed ones.
    pub device_open_attempts: usize,
    pub device_opens: usize,
    pub device_closes: usize,
    pub interface_open_attempts: usize,
    pub interface_opens: usize,
    pub interface_closes: usize,
    /// Configuration values passed to `set_configuration`, in order.
    pub set_configurations: Vec<u8>,
    /// Iterator rewinds; the retry loop pairs each with one sleep.
    pub resets: usize,
}

impl Ledger {
    pub fn balanced(&self) -> bool {
        self.candidates_yielded == self.candidates_released
            && self.plugins_created == self.plugins_destroyed
            && self.controls_created == self.controls_released
            && self.device_opens == self.device_closes
            && self.interface_opens == self.interface_closes
    }
}

#[derive(Error, Debug)]
#[error("{0}")]
struct Scripted(&'static str);

#[derive(Copy, Clone, Debug)]
enum OpenBehavior {
    Succeed,
    Contended,
    Fail,
}

/// Scripted behavior for one fake interface.
#[derive(Clone, Debug)]
pub struct FakeInterface {
    number: u8,
    plugin_fails: bool,
    open_fails: bool,
    endpoints: Vec<EndpointInfo>,
}

impl FakeInterface {
    pub fn new(number: u8) -> Self {
        FakeInterface {
            number,
            plugin_fails: false,
            open_fails: false,
            endpoints: Vec::new(),
        }
    }

    /// Plugin creation for this interface's candidate fails.
    pub fn plugin_fails(mut self) -> Self {
        self.plugin_fails = true;
        self
    }

    /// Claiming the interface fails (with a non-contention error).
    pub fn open_fails(mut self) -> Self {
        self.open_fails = true;
        self
    }

    pub fn with_endpoints(mut self, endpoints: Vec<EndpointInfo>) -> Self {
        self.endpoints = endpoints;
        self
    }
}

/// Scripted behavior for one fake device. The default is the friendly case:
/// one configuration with value 1, opens succeed immediately, no interfaces.
#[derive(Clone, Debug)]
pub struct FakeDevice {
    id: UsbId,
    release: u16,
    configurations: u8,
    configuration_value: u8,
    plugin_fails: bool,
    query_fails: bool,
    opens: Vec<OpenBehavior>,
    interfaces: Vec<FakeInterface>,
}

impl FakeDevice {
    pub fn new(id: UsbId) -> Self {
        FakeDevice {
            id,
            release: 0x0100,
            configurations: 1,
            configuration_value: 1,
            plugin_fails: false,
            query_fails: false,
            opens: vec![OpenBehavior::Succeed],
            interfaces: Vec::new(),
        }
    }

    /// Every open attempt reports exclusive-access contention.
    pub fn contended(mut self) -> Self {
        self.opens = vec![OpenBehavior::Contended];
        self
    }

    /// The first `attempts` open attempts report contention; later ones
    /// succeed, as if the other owner let go.
    pub fn contended_for(mut self, attempts: usize) -> Self {
        let mut opens = vec![OpenBehavior::Contended; attempts];
        opens.push(OpenBehavior::Succeed);
        self.opens = opens;
        self
    }

    /// Every open attempt fails with a non-contention host error.
    pub fn open_fails(mut self) -> Self {
        self.opens = vec![OpenBehavior::Fail];
        self
    }

    /// Plugin creation for this device's candidate fails.
    pub fn plugin_fails(mut self) -> Self {
        self.plugin_fails = true;
        self
    }

    /// The plugin is created but querying the control object fails.
    pub fn query_fails(mut self) -> Self {
        self.query_fails = true;
        self
    }

    pub fn with_configurations(mut self, configurations: u8) -> Self {
        self.configurations = configurations;
        self
    }

    pub fn with_configuration_value(mut self, value: u8) -> Self {
        self.configuration_value = value;
        self
    }

    pub fn with_release(mut self, release: u16) -> Self {
        self.release = release;
        self
    }

    pub fn with_interfaces(mut self, interfaces: Vec<FakeInterface>) -> Self {
        self.interfaces = interfaces;
        self
    }
}

struct DeviceState {
    script: FakeDevice,
    open_attempts: usize,
    open: bool,
}

struct State {
    devices: Vec<DeviceState>,
    ledger: Ledger,
}

type Shared = Rc<RefCell<State>>;

/// The in-memory host. Single-threaded by design, like the model it stands
/// in for; handles share state through `Rc`.
pub struct FakeHost {
    state: Shared,
}

impl FakeHost {
    pub fn new(devices: Vec<FakeDevice>) -> Self {
        let devices = devices
            .into_iter()
            .map(|script| DeviceState {
                script,
                open_attempts: 0,
                open: false,
            })
            .collect();
        FakeHost {
            state: Rc::new(RefCell::new(State {
                devices,
                ledger: Ledger::default(),
            })),
        }
    }

    /// Snapshot of the ledger so far.
    pub fn ledger(&self) -> Ledger {
        self.state.borrow().ledger.clone()
    }
}

impl UsbHost for FakeHost {
    type Device = FakeDeviceControl;
    type Interface = FakeInterfaceControl;
    type DeviceCandidate = FakeDeviceCandidate;
    type DevicePlugin = FakeDevicePlugin;
    type InterfaceCandidate = FakeInterfaceCandidate;
    type InterfacePlugin = FakeInterfacePlugin;
    type DeviceIter = FakeDeviceIter;
    type InterfaceIter = FakeInterfaceIter;

    fn devices_matching(&self, id: UsbId) -> Result<FakeDeviceIter, HostError> {
        let state = self.state.borrow();
        let matches = state
            .devices
            .iter()
            .enumerate()
            .filter(|(_, device)| device.script.id == id)
            .map(|(index, _)| index)
            .collect();
        Ok(FakeDeviceIter {
            state: Rc::clone(&self.state),
            matches,
            pos: 0,
        })
    }

    fn interfaces_matching(&self, spec: InterfaceMatch) -> Result<FakeInterfaceIter, HostError> {
        let state = self.state.borrow();
        let mut items = Vec::new();
        for (device_index, device) in state.devices.iter().enumerate() {
            if device.script.id != spec.id
                || device.script.configuration_value != spec.configuration
            {
                continue;
            }
            for (interface_index, interface) in device.script.interfaces.iter().enumerate() {
                if interface.number == spec.interface_number {
                    items.push((device_index, interface_index));
                }
            }
        }
        Ok(FakeInterfaceIter {
            state: Rc::clone(&self.state),
            items,
            pos: 0,
        })
    }
}

pub struct FakeDeviceIter {
    state: Shared,
    matches: Vec<usize>,
    pos: usize,
}

impl CandidateIter for FakeDeviceIter {
    type Candidate = FakeDeviceCandidate;

    fn next(&mut self) -> Option<FakeDeviceCandidate> {
        let index = *self.matches.get(self.pos)?;
        self.pos += 1;
        self.state.borrow_mut().ledger.candidates_yielded += 1;
        Some(FakeDeviceCandidate {
            state: Rc::clone(&self.state),
            index,
        })
    }

    fn reset(&mut self) {
        self.pos = 0;
        self.state.borrow_mut().ledger.resets += 1;
    }
}

pub struct FakeDeviceCandidate {
    state: Shared,
    index: usize,
}

impl Candidate for FakeDeviceCandidate {
    type Plugin = FakeDevicePlugin;

    fn create_plugin(&self) -> Result<FakeDevicePlugin, HostError> {
        let mut state = self.state.borrow_mut();
        if state.devices[self.index].script.plugin_fails {
            return Err(HostError::service(
                "creating plugin interface",
                Scripted("scripted plugin failure"),
            ));
        }
        state.ledger.plugins_created += 1;
        Ok(FakeDevicePlugin {
            state: Rc::clone(&self.state),
            index: self.index,
        })
    }

    fn release(self) {
        self.state.borrow_mut().ledger.candidates_released += 1;
    }
}

pub struct FakeDevicePlugin {
    state: Shared,
    index: usize,
}

impl Plugin for FakeDevicePlugin {
    type Control = FakeDeviceControl;

    fn query_control(&self) -> Result<FakeDeviceControl, HostError> {
        let mut state = self.state.borrow_mut();
        if state.devices[self.index].script.query_fails {
            return Err(HostError::service(
                "querying device control object",
                Scripted("scripted query failure"),
            ));
        }
        state.ledger.controls_created += 1;
        Ok(FakeDeviceControl {
            state: Rc::clone(&self.state),
            index: self.index,
            open: false,
        })
    }

    fn destroy(self) {
        self.state.borrow_mut().ledger.plugins_destroyed += 1;
    }
}

pub struct FakeDeviceControl {
    state: Shared,
    index: usize,
    open: bool,
}

impl DeviceControl for FakeDeviceControl {
    type InterfaceIter = FakeInterfaceIter;

    fn usb_id(&self) -> Result<UsbId, HostError> {
        Ok(self.state.borrow().devices[self.index].script.id)
    }

    fn release_number(&self) -> Result<u16, HostError> {
        Ok(self.state.borrow().devices[self.index].script.release)
    }

    fn num_configurations(&self) -> Result<u8, HostError> {
        Ok(self.state.borrow().devices[self.index].script.configurations)
    }

    fn config_descriptor(&self, _index: u8) -> Result<ConfigDescriptor, HostError> {
        let state = self.state.borrow();
        let script = &state.devices[self.index].script;
        Ok(ConfigDescriptor {
            value: script.configuration_value,
            num_interfaces: script.interfaces.len() as u8,
        })
    }

    fn open(&mut self) -> Result<(), HostError> {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        state.ledger.device_open_attempts += 1;

        let device = &mut state.devices[self.index];
        let attempt = device.open_attempts;
        device.open_attempts += 1;

        let behavior = device.script.opens[attempt.min(device.script.opens.len() - 1)];
        match behavior {
            OpenBehavior::Succeed => {
                device.open = true;
                state.ledger.device_opens += 1;
                self.open = true;
                Ok(())
            }
            OpenBehavior::Contended => Err(HostError::ExclusiveAccess),
            OpenBehavior::Fail => Err(HostError::service(
                "opening device",
                Scripted("scripted open failure"),
            )),
        }
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        let mut state = self.state.borrow_mut();
        state.devices[self.index].open = false;
        state.ledger.device_closes += 1;
    }

    fn set_configuration(&mut self, value: u8) -> Result<(), HostError> {
        if !self.open {
            return Err(HostError::service(
                "setting configuration",
                Scripted("device is not open"),
            ));
        }
        self.state.borrow_mut().ledger.set_configurations.push(value);
        Ok(())
    }

    fn interfaces(&self) -> Result<FakeInterfaceIter, HostError> {
        if !self.open {
            // Enforces the ordering guarantee: no interface enumeration
            // before the device itself is opened.
            return Err(HostError::service(
                "creating interface iterator",
                Scripted("device is not open"),
            ));
        }
        let count = self.state.borrow().devices[self.index].script.interfaces.len();
        Ok(FakeInterfaceIter {
            state: Rc::clone(&self.state),
            items: (0..count).map(|i| (self.index, i)).collect(),
            pos: 0,
        })
    }

    fn release(self) {
        self.state.borrow_mut().ledger.controls_released += 1;
    }
}

pub struct FakeInterfaceIter {
    state: Shared,
    items: Vec<(usize, usize)>,
    pos: usize,
}

impl CandidateIter for FakeInterfaceIter {
    type Candidate = FakeInterfaceCandidate;

    fn next(&mut self) -> Option<FakeInterfaceCandidate> {
        let (device_index, interface_index) = *self.items.get(self.pos)?;
        self.pos += 1;
        self.state.borrow_mut().ledger.candidates_yielded += 1;
        Some(FakeInterfaceCandidate {
            state: Rc::clone(&self.state),
            device_index,
            interface_index,
        })
    }

    fn reset(&mut self) {
        self.pos = 0;
        self.state.borrow_mut().ledger.resets += 1;
    }
}

pub struct FakeInterfaceCandidate {
    state: Shared,
    device_index: usize,
    interface_index: usize,
}

impl FakeInterfaceCandidate {
    fn script(&self) -> FakeInterface {
        self.state.borrow().devices[self.device_index].script.interfaces[self.interface_index]
            .clone()
    }
}

impl Candidate for FakeInterfaceCandidate {
    type Plugin = FakeInterfacePlugin;

    fn create_plugin(&self) -> Result<FakeInterfacePlugin, HostError> {
        if self.script().plugin_fails {
            return Err(HostError::service(
                "creating plugin interface",
                Scripted("scripted plugin failure"),
            ));
        }
        self.state.borrow_mut().ledger.plugins_created += 1;
        Ok(FakeInterfacePlugin {
            state: Rc::clone(&self.state),
            device_index: self.device_index,
            interface_index: self.interface_index,
        })
    }

    fn release(self) {
        self.state.borrow_mut().ledger.candidates_released += 1;
    }
}

pub struct FakeInterfacePlugin {
    state: Shared,
    device_index: usize,
    interface_index: usize,
}

impl Plugin for FakeInterfacePlugin {
    type Control = FakeInterfaceControl;

    fn query_control(&self) -> Result<FakeInterfaceControl, HostError> {
        self.state.borrow_mut().ledger.controls_created += 1;
        Ok(FakeInterfaceControl {
            state: Rc::clone(&self.state),
            device_index: self.device_index,
            interface_index: self.interface_index,
            open: false,
        })
    }

    fn destroy(self) {
        self.state.borrow_mut().ledger.plugins_destroyed += 1;
    }
}

pub struct FakeInterfaceControl {
    state: Shared,
    device_index: usize,
    interface_index: usize,
    open: bool,
}

impl FakeInterfaceControl {
    fn script(&self) -> FakeInterface {
        self.state.borrow().devices[self.device_index].script.interfaces[self.interface_index]
            .clone()
    }

    /// The interface number this control object stands for.
    pub fn number(&self) -> u8 {
        self.script().number
    }
}

impl InterfaceControl for FakeInterfaceControl {
    fn open(&mut self) -> Result<(), HostError> {
        let open_fails = self.script().open_fails;
        let mut state = self.state.borrow_mut();
        state.ledger.interface_open_attempts += 1;
        if open_fails {
            return Err(HostError::service(
                "claiming interface",
                Scripted("scripted claim failure"),
            ));
        }
        state.ledger.interface_opens += 1;
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        self.state.borrow_mut().ledger.interface_closes += 1;
    }

    fn endpoints(&self) -> Result<Vec<EndpointInfo>, HostError> {
        Ok(self.script().endpoints)
    }

    fn release(self) {
        self.state.borrow_mut().ledger.controls_released += 1;
    }
}
