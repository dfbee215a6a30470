//! Vulkan instance creation and the debug messenger.

use crate::error::{classify_result, GpuError, Result, VkFailure};
use ash::vk;
use std::ffi::{c_char, c_void, CStr, CString};
use vkproc_core::DebugLevel;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Surface extensions the windowing layer needs plus platform extras.
///
/// `window_extensions` comes from the display handle; without one a
/// headless instance is created.
pub fn instance_extensions(window_extensions: &[*const c_char]) -> Vec<*const c_char> {
    let mut extensions = window_extensions.to_vec();
    #[cfg(target_os = "macos")]
    extensions.push(ash::khr::portability_enumeration::NAME.as_ptr());
    extensions
}

/// Layers requested for a debug level.
pub fn validation_layers(level: DebugLevel) -> Vec<&'static CStr> {
    if level.wants_validation() {
        vec![VALIDATION_LAYER]
    } else {
        Vec::new()
    }
}

/// Create a Vulkan instance targeting Vulkan 1.1.
///
/// With a debug level the validation layer and debug-utils extension are
/// requested. If the loader rejects them the instance is created again
/// without, and a warning is logged.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    window_extensions: &[*const c_char],
    debug_level: DebugLevel,
) -> Result<(ash::Instance, bool)> {
    let app_name = CString::new(app_name)
        .map_err(|e| GpuError::InvalidState(format!("application name: {e}")))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"vkproc")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_1);

    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let base_extensions = instance_extensions(window_extensions);

    let try_create = |with_debug: bool| {
        let mut extensions = base_extensions.clone();
        let layers: Vec<*const c_char> = if with_debug {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
            validation_layers(debug_level)
                .iter()
                .map(|layer| layer.as_ptr())
                .collect()
        } else {
            Vec::new()
        };

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers)
            .flags(create_flags);
        entry.create_instance(&create_info, None)
    };

    let with_debug = debug_level.wants_validation();
    match try_create(with_debug) {
        Ok(instance) => Ok((instance, with_debug)),
        Err(err) if with_debug => {
            if let VkFailure::Warning(msg) = classify_result(err) {
                tracing::warn!("debug instance failed ({msg}), retrying without validation");
                let instance = try_create(false)?;
                Ok((instance, false))
            } else {
                Err(err.into())
            }
        }
        Err(err) => Err(err.into()),
    }
}

/// Forwards validation output into `tracing`.
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    if callback_data.is_null() {
        return vk::FALSE;
    }
    // SAFETY: the loader passes a valid callback data pointer for the duration of the call.
    let data = unsafe { &*callback_data };
    let message = if data.p_message.is_null() {
        "no message".into()
    } else {
        // SAFETY: p_message is a null-terminated string owned by the loader.
        unsafe { CStr::from_ptr(data.p_message) }.to_string_lossy()
    };

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        tracing::error!(target: "vulkan", ?message_type, "{message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        tracing::warn!(target: "vulkan", ?message_type, "{message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        tracing::info!(target: "vulkan", ?message_type, "{message}");
    } else {
        tracing::trace!(target: "vulkan", ?message_type, "{message}");
    }
    vk::FALSE
}

/// A debug-utils messenger.
pub struct DebugMessenger {
    loader: ash::ext::debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

impl DebugMessenger {
    /// Register a messenger; verbose output is only requested for [`DebugLevel::All`].
    ///
    /// # Safety
    /// The instance must have the debug-utils extension enabled.
    pub unsafe fn new(entry: &ash::Entry, instance: &ash::Instance, level: DebugLevel) -> Result<Self> {
        let mut severity = vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
            | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING;
        if level.is_verbose() {
            severity |= vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                | vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE;
        }
        let mut message_type = vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION;
        if level.wants_validation_features() {
            message_type |= vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE;
        }

        let info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(severity)
            .message_type(message_type)
            .pfn_user_callback(Some(debug_callback));
        let loader = ash::ext::debug_utils::Instance::new(entry, instance);
        let messenger = loader.create_debug_utils_messenger(&info, None)?;
        Ok(Self { loader, messenger })
    }

    /// # Safety
    /// Must be called before the instance is destroyed.
    pub unsafe fn destroy(&self) {
        self.loader
            .destroy_debug_utils_messenger(self.messenger, None);
    }
}
