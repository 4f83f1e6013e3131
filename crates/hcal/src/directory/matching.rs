// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection matching rules.
//!
//! - Names must be equal.
//! - Topic directions (or service roles) must be opposite.
//! - When both sides advertise a data type, type name and encoding must be
//!   equal. Differing descriptors only produce a warning.

use crate::entity::DataTypeInformation;
use crate::registration::{ServiceInfo, TopicInfo};

/// Type compatibility of two advertised data types.
pub fn types_compatible(topic: &str, a: &DataTypeInformation, b: &DataTypeInformation) -> bool {
    if a.is_empty() || b.is_empty() {
        return true;
    }
    if a.name != b.name || a.encoding != b.encoding {
        log::debug!(
            "[DIR] {}: type {}/{} does not match {}/{}",
            topic,
            a.encoding,
            a.name,
            b.encoding,
            b.name
        );
        return false;
    }
    if !a.descriptor.is_empty() && !b.descriptor.is_empty() && a.descriptor != b.descriptor {
        log::warn!(
            "[DIR] {}: descriptors of {} differ, connecting anyway",
            topic,
            a.name
        );
    }
    true
}

/// True if a publisher/subscriber pair connects.
pub fn topics_match(a: &TopicInfo, b: &TopicInfo) -> bool {
    a.direction == b.direction.opposite()
        && a.topic_name == b.topic_name
        && types_compatible(&a.topic_name, &a.data_type, &b.data_type)
}

/// True if a server/client pair connects.
pub fn services_match(a: &ServiceInfo, b: &ServiceInfo) -> bool {
    a.role != b.role && a.service_name == b.service_name
}
