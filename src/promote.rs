use log::{info, warn};

use crate::host::{Candidate, ControlOf, DeviceControl, Plugin};

/// Promote a candidate service handle into its control object.
///
/// The candidate is consumed: it is released here whether or not promotion
/// succeeds, and the intermediate plugin object never outlives this call.
/// Failures are logged and reported as [None]; they must not abort the
/// caller's enumeration.
pub fn promote<C: Candidate>(candidate: C) -> Option<ControlOf<C>> {
    let plugin = match candidate.create_plugin() {
        Ok(plugin) => plugin,
        Err(e) => {
            warn!("unable to create plugin interface for candidate: {e}");
            candidate.release();
            return None;
        }
    };
    // Done with the candidate now that we have the plugin.
    candidate.release();

    let control = plugin.query_control();
    plugin.destroy();

    match control {
        Ok(control) => Some(control),
        Err(e) => {
            warn!("unable to query control object from plugin: {e}");
            None
        }
    }
}

/// [promote] for device candidates, logging what was found.
pub fn device_control<C>(candidate: C) -> Option<ControlOf<C>>
where
    C: Candidate,
    ControlOf<C>: DeviceControl,
{
    let device = promote(candidate)?;

    if let (Ok(id), Ok(release)) = (device.usb_id(), device.release_number()) {
        info!("found device {id}, release {release:#06x}");
    }

    Some(device)
}
