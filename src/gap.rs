//! Generic Access Profile ([Vol 3] Part C) identifiers.

pub use uuid::*;

mod uuid;

/// GAP service ([Assigned Numbers] Section 3.4.2).
pub const GENERIC_ACCESS: Uuid16 = uuid16(0x1800);
/// GATT service ([Assigned Numbers] Section 3.4.2).
pub const GENERIC_ATTRIBUTE: Uuid16 = uuid16(0x1801);

/// Primary service declaration ([Vol 3] Part G, Section 3.1).
pub const PRIMARY_SERVICE: Uuid16 = uuid16(0x2800);
/// Secondary service declaration ([Vol 3] Part G, Section 3.1).
pub const SECONDARY_SERVICE: Uuid16 = uuid16(0x2801);
/// Include declaration ([Vol 3] Part G, Section 3.2).
pub const INCLUDE: Uuid16 = uuid16(0x2802);
/// Characteristic declaration ([Vol 3] Part G, Section 3.3.1).
pub const CHARACTERISTIC: Uuid16 = uuid16(0x2803);
/// Client Characteristic Configuration descriptor
/// ([Vol 3] Part G, Section 3.3.3.3).
pub const CLIENT_CHARACTERISTIC_CONFIGURATION: Uuid16 = uuid16(0x2902);

/// Device Name characteristic ([Vol 3] Part C, Section 12.1).
pub const DEVICE_NAME: Uuid16 = uuid16(0x2A00);
/// Appearance characteristic ([Vol 3] Part C, Section 12.2).
pub const APPEARANCE: Uuid16 = uuid16(0x2A01);
/// Service Changed characteristic ([Vol 3] Part G, Section 7.1).
pub const SERVICE_CHANGED: Uuid16 = uuid16(0x2A05);
