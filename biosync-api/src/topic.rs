//! Topic helpers for the `<namespace>/<device_id>[/...]` convention.

/// Returns the device segment of `topic` when it lives under `namespace`.
pub fn device_id_from_topic<'a>(topic: &'a str, namespace: &str) -> Option<&'a str> {
    let mut segments = topic.split('/');

    if segments.next()? != namespace {
        return None;
    }

    segments.next().filter(|segment| !segment.is_empty())
}

/// Wildcard pattern that matches every device sub-topic of `namespace`.
pub fn subscription_pattern(namespace: &str) -> String {
    format!("{namespace}/#")
}
