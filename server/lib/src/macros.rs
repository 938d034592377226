//! Tagged logging macros. Every log line carries an [`EventTag`] id so that
//! downstream log pipelines can classify events without parsing the message.

use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Debug, Clone, Copy, IntoPrimitive, TryFromPrimitive)]
#[repr(u64)]
pub enum EventTag {
    AdminDebug,
    AdminError,
    AdminWarn,
    AdminInfo,
    RequestError,
    RequestWarn,
    RequestInfo,
    RequestTrace,
    SecurityCritical,
    SecurityInfo,
    SecurityError,
}

impl EventTag {
    pub fn pretty(self) -> &'static str {
        match self {
            EventTag::AdminDebug => "admin.debug",
            EventTag::AdminError => "admin.error",
            EventTag::AdminWarn => "admin.warn",
            EventTag::AdminInfo => "admin.info",
            EventTag::RequestError => "request.error",
            EventTag::RequestWarn => "request.warn",
            EventTag::RequestInfo => "request.info",
            EventTag::RequestTrace => "request.trace",
            EventTag::SecurityCritical => "security.critical",
            EventTag::SecurityInfo => "security.info",
            EventTag::SecurityError => "security.error",
        }
    }
}

macro_rules! tagged_event {
    ($level:ident, $event_tag:path, $($arg:tt)*) => {{
        let event_tag_id: u64 = ($event_tag).into();
        ::tracing::event!(::tracing::Level::$level, event_tag_id, $($arg)*)
    }}
}

macro_rules! admin_debug {
    ($($arg:tt)*) => { tagged_event!(DEBUG, $crate::macros::EventTag::AdminDebug, $($arg)*) }
}

macro_rules! admin_error {
    ($($arg:tt)*) => { tagged_event!(ERROR, $crate::macros::EventTag::AdminError, $($arg)*) }
}

macro_rules! admin_warn {
    ($($arg:tt)*) => { tagged_event!(WARN, $crate::macros::EventTag::AdminWarn, $($arg)*) }
}

macro_rules! admin_info {
    ($($arg:tt)*) => { tagged_event!(INFO, $crate::macros::EventTag::AdminInfo, $($arg)*) }
}

macro_rules! request_trace {
    ($($arg:tt)*) => { tagged_event!(TRACE, $crate::macros::EventTag::RequestTrace, $($arg)*) }
}

macro_rules! security_critical {
    ($($arg:tt)*) => { tagged_event!(INFO, $crate::macros::EventTag::SecurityCritical, $($arg)*) }
}

macro_rules! security_info {
    ($($arg:tt)*) => { tagged_event!(INFO, $crate::macros::EventTag::SecurityInfo, $($arg)*) }
}

macro_rules! security_error {
    ($($arg:tt)*) => { tagged_event!(ERROR, $crate::macros::EventTag::SecurityError, $($arg)*) }
}
