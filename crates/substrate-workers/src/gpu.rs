//! GPU admission: picks a device for an inference run given each
//! device's configured capacity and what is currently in use. Kept
//! deliberately simple — a watermark per device, no live driver query
//! — since the corpus this is ported from (`inference_worker.py`) only
//! ever consulted a static device table plus its own bookkeeping of
//! what it had leased out.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    pub id: String,
    pub max_memory_mb: u64,
    /// Fraction of `max_memory_mb` this process is allowed to use, in (0, 1].
    pub utilization_cap: f64,
    /// If set, only these model ids may be scheduled on this device.
    pub allow_list: Option<Vec<String>>,
}

impl DeviceDescriptor {
    fn usable_mb(&self) -> u64 {
        (self.max_memory_mb as f64 * self.utilization_cap) as u64
    }

    fn accepts(&self, model_id: &str) -> bool {
        match &self.allow_list {
            Some(list) => list.iter().any(|m| m == model_id),
            None => true,
        }
    }
}

/// Tracks how much of each device's usable memory is currently leased
/// out, and picks a device with enough headroom for a new request.
pub struct GpuAdmission {
    devices: Vec<DeviceDescriptor>,
    used_mb: Mutex<HashMap<String, u64>>,
}

impl GpuAdmission {
    pub fn new(devices: Vec<DeviceDescriptor>) -> Self {
        let used_mb = devices.iter().map(|d| (d.id.clone(), 0u64)).collect();
        Self {
            devices,
            used_mb: Mutex::new(used_mb),
        }
    }

    /// Picks the device with the most free headroom that can fit
    /// `required_mb` and accepts `model_id`. Returns `None` if no
    /// configured device qualifies — the caller falls back to CPU or
    /// fails the request, its choice.
    pub fn find_suitable(&self, required_mb: u64, model_id: &str) -> Option<String> {
        let used = self.used_mb.lock().expect("gpu admission lock poisoned");
        self.devices
            .iter()
            .filter(|d| d.accepts(model_id))
            .filter_map(|d| {
                let free = d.usable_mb().saturating_sub(*used.get(&d.id).unwrap_or(&0));
                (free >= required_mb).then_some((d, free))
            })
            .max_by_key(|(_, free)| *free)
            .map(|(d, _)| d.id.clone())
    }

    /// Record that `device_id` now holds an extra `mb` of reservation.
    pub fn reserve(&self, device_id: &str, mb: u64) {
        let mut used = self.used_mb.lock().expect("gpu admission lock poisoned");
        if let Some(entry) = used.get_mut(device_id) {
            *entry += mb;
        }
    }

    /// Release a prior reservation, saturating at zero.
    pub fn release(&self, device_id: &str, mb: u64) {
        let mut used = self.used_mb.lock().expect("gpu admission lock poisoned");
        if let Some(entry) = used.get_mut(device_id) {
            *entry = entry.saturating_sub(mb);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str, max_mb: u64, cap: f64) -> DeviceDescriptor {
        DeviceDescriptor {
            id: id.to_string(),
            max_memory_mb: max_mb,
            utilization_cap: cap,
            allow_list: None,
        }
    }

    #[test]
    fn picks_device_with_most_headroom() {
        let admission = GpuAdmission::new(vec![device("gpu0", 8000, 0.9), device("gpu1", 24000, 0.9)]);
        assert_eq!(admission.find_suitable(4000, "llama-8b").as_deref(), Some("gpu1"));
    }

    #[test]
    fn respects_utilization_cap() {
        let admission = GpuAdmission::new(vec![device("gpu0", 8000, 0.5)]);
        assert_eq!(admission.find_suitable(5000, "llama-8b"), None);
        assert_eq!(admission.find_suitable(3000, "llama-8b").as_deref(), Some("gpu0"));
    }

    #[test]
    fn allow_list_excludes_non_matching_models() {
        let mut gpu0 = device("gpu0", 24000, 0.9);
        gpu0.allow_list = Some(vec!["llama-70b".to_string()]);
        let admission = GpuAdmission::new(vec![gpu0]);
        assert_eq!(admission.find_suitable(1000, "llama-8b"), None);
        assert_eq!(admission.find_suitable(1000, "llama-70b").as_deref(), Some("gpu0"));
    }

    #[test]
    fn reserve_and_release_round_trip() {
        let admission = GpuAdmission::new(vec![device("gpu0", 8000, 1.0)]);
        admission.reserve("gpu0", 6000);
        assert_eq!(admission.find_suitable(3000, "m"), None);
        admission.release("gpu0", 6000);
        assert_eq!(admission.find_suitable(3000, "m").as_deref(), Some("gpu0"));
    }
}
