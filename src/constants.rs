pub const PROTOCOL_CACHE_STATUS_KEY: &str = "X-Cache";
pub const PROTOCOL_REQUEST_ID_KEY: &str = "X-Request-ID";

pub const CACHE_STATUS_HIT: &str = "HIT";
pub const CACHE_STATUS_MISS: &str = "MISS";
pub const CACHE_STATUS_BYPASS: &str = "BYPASS";
