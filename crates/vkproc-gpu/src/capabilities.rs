//! Adapter identification, device limits and adapter selection.

use crate::error::{GpuError, Result};
use ash::vk;
use std::ffi::CStr;
use std::ops::Range;

/// Lowest device API version the backend runs on.
pub const MIN_API_VERSION: u32 = vk::API_VERSION_1_1;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Amd,
    ImgTec,
    Apple,
    Nvidia,
    Arm,
    Qualcomm,
    Intel,
    Mesa,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub const fn from_vendor_id(id: u32) -> Self {
        match id {
            0x1002 => Self::Amd,
            0x1010 => Self::ImgTec,
            0x106B => Self::Apple,
            0x10DE => Self::Nvidia,
            0x13B5 => Self::Arm,
            0x5143 => Self::Qualcomm,
            0x8086 => Self::Intel,
            0x10005 => Self::Mesa,
            other => Self::Other(other),
        }
    }

    /// Display name reported to the front end.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Amd => "AMD",
            Self::ImgTec => "ImgTec",
            Self::Apple => "Apple",
            Self::Nvidia => "NVIDIA",
            Self::Arm => "ARM",
            Self::Qualcomm => "Qualcomm",
            Self::Intel => "INTEL",
            Self::Mesa => "Mesa",
            Self::Other(_) => "unknown",
        }
    }
}

/// Coarse adapter class, ordered from most to least preferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GpuType {
    Discrete,
    Integrated,
    Virtual,
    Cpu,
    Invalid,
}

impl From<vk::PhysicalDeviceType> for GpuType {
    fn from(ty: vk::PhysicalDeviceType) -> Self {
        match ty {
            vk::PhysicalDeviceType::DISCRETE_GPU => Self::Discrete,
            vk::PhysicalDeviceType::INTEGRATED_GPU => Self::Integrated,
            vk::PhysicalDeviceType::VIRTUAL_GPU => Self::Virtual,
            vk::PhysicalDeviceType::CPU => Self::Cpu,
            _ => Self::Invalid,
        }
    }
}

/// Format a driver version the way the vendor publishes it.
pub fn driver_version_string(vendor_id: u32, version: u32, windows: bool) -> String {
    match GpuVendor::from_vendor_id(vendor_id) {
        GpuVendor::Nvidia => format!(
            "{}.{}.{}.{}",
            (version >> 22) & 0x3ff,
            (version >> 14) & 0x0ff,
            (version >> 6) & 0x0ff,
            version & 0x003f
        ),
        GpuVendor::Intel if windows => format!("{}.{}", version >> 14, version & 0x3fff),
        _ => format!(
            "{}.{}.{}",
            version >> 22,
            (version >> 12) & 0x3ff,
            version & 0xfff
        ),
    }
}

/// Device limits the backend sizes its resources by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    pub non_coherent_atom_size: u64,
    pub optimal_buffer_copy_offset_alignment: u64,
    pub max_texture_size: u32,
    pub max_sampler_anisotropy: u32,
    pub min_uniform_buffer_offset_alignment: u64,
    pub color_sample_counts: vk::SampleCountFlags,
}

impl DeviceLimits {
    pub fn from_vk(limits: &vk::PhysicalDeviceLimits) -> Self {
        Self {
            non_coherent_atom_size: limits.non_coherent_atom_size,
            optimal_buffer_copy_offset_alignment: limits.optimal_buffer_copy_offset_alignment,
            max_texture_size: limits.max_image_dimension2_d,
            max_sampler_anisotropy: limits.max_sampler_anisotropy as u32,
            min_uniform_buffer_offset_alignment: limits.min_uniform_buffer_offset_alignment,
            color_sample_counts: limits.framebuffer_color_sample_counts,
        }
    }

    /// Largest supported sample count as a number.
    pub fn max_samples(&self) -> u32 {
        SAMPLE_COUNTS
            .iter()
            .rev()
            .find(|(_, flag)| self.color_sample_counts.contains(*flag))
            .map_or(1, |(count, _)| *count)
    }
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            non_coherent_atom_size: 1,
            optimal_buffer_copy_offset_alignment: 1,
            max_texture_size: 4096,
            max_sampler_anisotropy: 1,
            min_uniform_buffer_offset_alignment: 256,
            color_sample_counts: vk::SampleCountFlags::TYPE_1,
        }
    }
}

const SAMPLE_COUNTS: [(u32, vk::SampleCountFlags); 7] = [
    (1, vk::SampleCountFlags::TYPE_1),
    (2, vk::SampleCountFlags::TYPE_2),
    (4, vk::SampleCountFlags::TYPE_4),
    (8, vk::SampleCountFlags::TYPE_8),
    (16, vk::SampleCountFlags::TYPE_16),
    (32, vk::SampleCountFlags::TYPE_32),
    (64, vk::SampleCountFlags::TYPE_64),
];

/// Largest supported power-of-two sample count not above `requested`.
pub fn resolve_sample_count(requested: u32, supported: vk::SampleCountFlags) -> vk::SampleCountFlags {
    SAMPLE_COUNTS
        .iter()
        .rev()
        .find(|(count, flag)| *count <= requested && supported.contains(*flag))
        .map_or(vk::SampleCountFlags::TYPE_1, |(_, flag)| *flag)
}

/// What adapter selection needs to know about one physical device.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor_id: u32,
    pub gpu_type: GpuType,
    pub api_version: u32,
    pub driver_version: u32,
    pub limits: DeviceLimits,
}

impl AdapterInfo {
    /// Read the properties of a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        Self::from_properties(&properties)
    }

    pub fn from_properties(properties: &vk::PhysicalDeviceProperties) -> Self {
        // SAFETY: the driver null-terminates device_name within the array.
        let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        Self {
            name,
            vendor_id: properties.vendor_id,
            gpu_type: properties.device_type.into(),
            api_version: properties.api_version,
            driver_version: properties.driver_version,
            limits: DeviceLimits::from_vk(&properties.limits),
        }
    }

    pub const fn vendor(&self) -> GpuVendor {
        GpuVendor::from_vendor_id(self.vendor_id)
    }

    /// "Vulkan X.Y.Z (driver: ...)".
    pub fn version_string(&self) -> String {
        format!(
            "Vulkan {}.{}.{} (driver: {})",
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            driver_version_string(self.vendor_id, self.driver_version, cfg!(windows))
        )
    }
}

/// One known-bad driver range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DenyRule {
    pub vendor_id: u32,
    pub windows_only: bool,
    pub driver_major: u32,
    pub driver_minor: u32,
    /// Driver patch range, in Vulkan version packing.
    pub driver_patch: Range<u32>,
    /// Adapters reporting an API version at or above this are exempt.
    pub api_below: u32,
}

impl DenyRule {
    fn matches(&self, adapter: &AdapterInfo, windows: bool) -> bool {
        if self.windows_only && !windows {
            return false;
        }
        let version = adapter.driver_version;
        adapter.vendor_id == self.vendor_id
            && version >> 22 == self.driver_major
            && (version >> 12) & 0x3ff == self.driver_minor
            && self.driver_patch.contains(&(version & 0xfff))
            && adapter.api_version < self.api_below
    }
}

/// Table of adapters that must not be selected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuDenylist {
    rules: Vec<DenyRule>,
}

impl Default for GpuDenylist {
    /// AMD Windows drivers 2.0.138 to 2.0.219 on API versions before 1.3.206.
    fn default() -> Self {
        Self {
            rules: vec![DenyRule {
                vendor_id: 0x1002,
                windows_only: true,
                driver_major: 2,
                driver_minor: 0,
                driver_patch: 138..220,
                api_below: vk::make_api_version(0, 1, 3, 206),
            }],
        }
    }
}

impl GpuDenylist {
    pub const fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    #[must_use]
    pub fn with_rule(mut self, rule: DenyRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn is_denied(&self, adapter: &AdapterInfo, windows: bool) -> bool {
        self.rules.iter().any(|rule| rule.matches(adapter, windows))
    }
}

/// Usable adapters as reported to the front end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuListEntry {
    pub name: String,
    pub gpu_type: GpuType,
}

/// Result of adapter selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterSelection {
    /// Index into the enumerated adapters.
    pub index: usize,
    pub usable: Vec<GpuListEntry>,
    /// What "auto" resolves to, regardless of the preference.
    pub auto: GpuListEntry,
}

/// Choose an adapter.
///
/// Adapters below [`MIN_API_VERSION`] or on the denylist are skipped. The
/// auto adapter is the first one of the best type. A preferred name picks
/// the first exact match and falls back to auto.
pub fn select_adapter(
    adapters: &[AdapterInfo],
    preferred: Option<&str>,
    denylist: &GpuDenylist,
    windows: bool,
) -> Result<AdapterSelection> {
    let mut usable = Vec::new();
    let mut auto: Option<usize> = None;
    let mut chosen: Option<usize> = None;

    for (index, adapter) in adapters.iter().enumerate() {
        if adapter.api_version < MIN_API_VERSION {
            tracing::debug!("skipping {}: api version too old", adapter.name);
            continue;
        }
        if denylist.is_denied(adapter, windows) {
            tracing::warn!("skipping {}: driver is on the denylist", adapter.name);
            continue;
        }
        usable.push(GpuListEntry {
            name: adapter.name.clone(),
            gpu_type: adapter.gpu_type,
        });

        if auto.map_or(true, |best| adapter.gpu_type < adapters[best].gpu_type) {
            auto = Some(index);
        }
        if chosen.is_none() && preferred == Some(adapter.name.as_str()) {
            chosen = Some(index);
        }
    }

    let auto = auto.ok_or(GpuError::NoSuitableDevice)?;
    if let (Some(name), None) = (preferred, chosen) {
        tracing::warn!("preferred gpu {name:?} not found, using auto selection");
    }
    Ok(AdapterSelection {
        index: chosen.unwrap_or(auto),
        usable,
        auto: GpuListEntry {
            name: adapters[auto].name.clone(),
            gpu_type: adapters[auto].gpu_type,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(name: &str, gpu_type: GpuType) -> AdapterInfo {
        AdapterInfo {
            name: name.to_string(),
            vendor_id: 0x10DE,
            gpu_type,
            api_version: vk::API_VERSION_1_2,
            driver_version: 0,
            limits: DeviceLimits::default(),
        }
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE).name(), "NVIDIA");
        assert_eq!(GpuVendor::from_vendor_id(0x1002).name(), "AMD");
        assert_eq!(GpuVendor::from_vendor_id(0x8086).name(), "INTEL");
        assert_eq!(GpuVendor::from_vendor_id(0x10005).name(), "Mesa");
        assert_eq!(GpuVendor::from_vendor_id(0x1234).name(), "unknown");
    }

    #[test]
    fn driver_versions_follow_vendor_packing() {
        let nvidia = (535 << 22) | (98 << 14) | (2 << 6) | 1;
        assert_eq!(driver_version_string(0x10DE, nvidia, false), "535.98.2.1");

        let intel = (101 << 14) | 4502;
        assert_eq!(driver_version_string(0x8086, intel, true), "101.4502");
        assert_eq!(
            driver_version_string(0x8086, vk::make_api_version(0, 23, 1, 4), false),
            "23.1.4"
        );
    }

    #[test]
    fn sample_count_rounds_down_to_supported_power_of_two() {
        let supported = vk::SampleCountFlags::TYPE_1
            | vk::SampleCountFlags::TYPE_2
            | vk::SampleCountFlags::TYPE_4
            | vk::SampleCountFlags::TYPE_8;
        assert_eq!(resolve_sample_count(6, supported), vk::SampleCountFlags::TYPE_4);
        assert_eq!(resolve_sample_count(8, supported), vk::SampleCountFlags::TYPE_8);
        assert_eq!(resolve_sample_count(16, supported), vk::SampleCountFlags::TYPE_8);
        assert_eq!(resolve_sample_count(0, supported), vk::SampleCountFlags::TYPE_1);

        let limits = DeviceLimits {
            color_sample_counts: supported,
            ..DeviceLimits::default()
        };
        assert_eq!(limits.max_samples(), 8);
    }

    #[test]
    fn auto_prefers_the_best_type() {
        let adapters = [
            adapter("llvmpipe", GpuType::Cpu),
            adapter("iGPU", GpuType::Integrated),
            adapter("dGPU", GpuType::Discrete),
            adapter("dGPU 2", GpuType::Discrete),
        ];
        let selection = select_adapter(&adapters, None, &GpuDenylist::empty(), false).unwrap();
        assert_eq!(selection.index, 2);
        assert_eq!(selection.auto.name, "dGPU");
        assert_eq!(selection.usable.len(), 4);
    }

    #[test]
    fn preferred_name_wins_and_missing_name_falls_back() {
        let adapters = [
            adapter("iGPU", GpuType::Integrated),
            adapter("dGPU", GpuType::Discrete),
        ];
        let denylist = GpuDenylist::empty();
        let selection = select_adapter(&adapters, Some("iGPU"), &denylist, false).unwrap();
        assert_eq!(selection.index, 0);
        assert_eq!(selection.auto.name, "dGPU");

        let selection = select_adapter(&adapters, Some("missing"), &denylist, false).unwrap();
        assert_eq!(selection.index, 1);
    }

    #[test]
    fn old_and_denied_adapters_are_skipped() {
        let mut old = adapter("old", GpuType::Discrete);
        old.api_version = vk::API_VERSION_1_0;

        let mut amd = adapter("amd", GpuType::Discrete);
        amd.vendor_id = 0x1002;
        amd.driver_version = vk::make_api_version(0, 2, 0, 150);
        amd.api_version = vk::make_api_version(0, 1, 2, 170);

        let fine = adapter("fine", GpuType::Integrated);
        let adapters = [old, amd, fine];

        let selection =
            select_adapter(&adapters, None, &GpuDenylist::default(), true).unwrap();
        assert_eq!(selection.index, 2);
        assert_eq!(selection.usable.len(), 1);

        // The AMD rule only applies on Windows.
        let selection =
            select_adapter(&adapters, None, &GpuDenylist::default(), false).unwrap();
        assert_eq!(selection.index, 1);
    }

    #[test]
    fn denylist_respects_api_exemption() {
        let mut amd = adapter("amd", GpuType::Discrete);
        amd.vendor_id = 0x1002;
        amd.driver_version = vk::make_api_version(0, 2, 0, 200);
        amd.api_version = vk::make_api_version(0, 1, 3, 206);
        assert!(!GpuDenylist::default().is_denied(&amd, true));
        amd.api_version = vk::make_api_version(0, 1, 3, 205);
        assert!(GpuDenylist::default().is_denied(&amd, true));
        amd.driver_version = vk::make_api_version(0, 2, 0, 137);
        assert!(!GpuDenylist::default().is_denied(&amd, true));
    }

    #[test]
    fn no_usable_adapter_is_an_error() {
        let mut old = adapter("old", GpuType::Discrete);
        old.api_version = vk::API_VERSION_1_0;
        assert!(matches!(
            select_adapter(&[old], None, &GpuDenylist::empty(), false),
            Err(GpuError::NoSuitableDevice)
        ));
    }
}
