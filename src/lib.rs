/// Shared types and the narrow traits a host USB service backend implements.
pub mod host;

/// Promote candidate service handles into control objects.
pub mod promote;

/// Find and exclusively open a matching device, retrying through contention.
pub mod acquire;

/// Pick one interface of an opened device and hand it to a consumer.
pub mod select;

/// Cooperative stop requests for interrupt-driven shutdown.
pub mod stop;

/// Real host backend over libusb.
pub mod native;

/// In-memory host backend with an instrumented handle ledger.
pub mod fake;
