use serde::{Deserialize, Serialize};

use crate::error::HandoffError;

/// CPU/memory (and optionally disk) shape a resumed VM must be given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceShape {
    pub vcpus: u32,
    pub memory_mb: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_gb: Option<u64>,
}

impl ResourceShape {
    pub fn new(vcpus: u32, memory_mb: u64) -> Self {
        Self {
            vcpus,
            memory_mb,
            disk_gb: None,
        }
    }

    pub fn with_disk(mut self, disk_gb: u64) -> Self {
        self.disk_gb = Some(disk_gb);
        self
    }

    /// Reads `<vcpu>` and `<memory unit=..>` out of a libvirt domain description.
    ///
    /// Memory is normalized to MiB; a missing unit attribute means KiB (libvirt default).
    pub fn from_libvirt_xml(xml: &str) -> Result<Self, HandoffError> {
        let missing = || {
            HandoffError::Resolution(
                "Cannot find memory size or CPU number of Base VM".to_string(),
            )
        };

        let (_, vcpu_text) = element(xml, "vcpu").ok_or_else(missing)?;
        let (memory_attrs, memory_text) = element(xml, "memory").ok_or_else(missing)?;

        let vcpus: u32 = vcpu_text.trim().parse().map_err(|_| missing())?;
        let memory: u64 = memory_text.trim().parse().map_err(|_| missing())?;
        let unit = attribute(memory_attrs, "unit")
            .unwrap_or("KiB")
            .to_ascii_lowercase();

        let memory_mb = match unit.as_str() {
            "mib" | "mb" | "m" => memory,
            "kib" | "kb" | "k" => memory / 1024,
            "gib" | "gb" | "g" => memory * 1024,
            "b" | "bytes" => memory / (1024 * 1024),
            other => {
                return Err(HandoffError::Resolution(format!(
                    "Unsupported memory unit in Base VM description: {}",
                    other
                )))
            }
        };

        Ok(Self::new(vcpus, memory_mb))
    }

    /// Minimal domain fragment carrying this shape, stored on base-disk images.
    pub fn to_libvirt_xml(&self) -> String {
        format!(
            "<domain><vcpu>{}</vcpu><memory unit='MiB'>{}</memory></domain>",
            self.vcpus, self.memory_mb
        )
    }
}

/// Returns (attributes, inner text) of the first `<name ...>text</name>`.
fn element<'a>(xml: &'a str, name: &str) -> Option<(&'a str, &'a str)> {
    let open = format!("<{}", name);
    let mut search_from = 0;
    loop {
        let start = search_from + xml[search_from..].find(&open)?;
        let after_name = start + open.len();
        // Skip elements that only share a prefix, e.g. <vcpupin> for <vcpu>.
        match xml[after_name..].chars().next() {
            Some(c) if c == '>' || c.is_whitespace() => {}
            _ => {
                search_from = after_name;
                continue;
            }
        }
        let tag_end = after_name + xml[after_name..].find('>')?;
        let attrs = &xml[after_name..tag_end];
        let close = format!("</{}>", name);
        let body_start = tag_end + 1;
        let body_end = body_start + xml[body_start..].find(&close)?;
        return Some((attrs, &xml[body_start..body_end]));
    }
}

fn attribute<'a>(attrs: &'a str, name: &str) -> Option<&'a str> {
    let key = format!("{}=", name);
    let idx = attrs.find(&key)?;
    let rest = &attrs[idx + key.len()..];
    let quote = rest.chars().next().filter(|c| *c == '\'' || *c == '"')?;
    let value = &rest[1..];
    let end = value.find(quote)?;
    Some(&value[..end])
}
