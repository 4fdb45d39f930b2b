//! Helpers shared by the transports and typed proxies.

use std::collections::HashMap;

use zvariant::{OwnedValue, Value};

/// Macro to convert Result to Option with error logging.
/// Usage: `try_log!(result, "context message")`
#[macro_export]
macro_rules! try_log {
    ($result:expr, $context:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => {
                log::warn!("{}: {:?}", $context, e);
                return None;
            }
        }
    };
}

/// Turns a property map into an `a{sv}` argument.
///
/// Each value ends up wrapped in a variant, as D-Bus dictionaries of
/// options expect.
pub(crate) fn options_dict(options: HashMap<String, OwnedValue>) -> Value<'static> {
    let entries: HashMap<String, Value<'static>> = options
        .into_iter()
        .map(|(key, value)| (key, Value::from(value)))
        .collect();
    Value::from(entries)
}

/// Wraps a plain value as an [`OwnedValue`].
///
/// Only file descriptors can fail to convert; callers passing plain data
/// can rely on `Some`.
pub fn owned_value<'a, V: Into<Value<'a>>>(value: V) -> Option<OwnedValue> {
    OwnedValue::try_from(value.into()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_dict_signature() {
        let mut options = HashMap::new();
        options.insert("Version".to_string(), owned_value(0x0102u16).unwrap());
        let dict = options_dict(options);
        assert_eq!(dict.value_signature().to_string(), "a{sv}");
    }

    #[test]
    fn empty_options_dict_signature() {
        let dict = options_dict(HashMap::new());
        assert_eq!(dict.value_signature().to_string(), "a{sv}");
    }

    #[test]
    fn owned_value_of_plain_data() {
        let value = owned_value("Serial Port").unwrap();
        assert_eq!(String::try_from(value).unwrap(), "Serial Port");
    }
}
