//! Instance creation.
//!
//! ```no_run
//! # use std::{borrow::Cow, sync::Arc};
//! # use tephra::{Instance, utils::Version};
//! let entry = Arc::new(unsafe { ash::Entry::load().unwrap() });
//! let mut builder = Instance::builder(entry).unwrap();
//! builder.info.api_version = Version::V1_3;
//! builder.info.application_name = Cow::Borrowed(c"My Application");
//! builder.enable_extension(ash::ext::debug_utils::NAME).ok();
//! builder.enable_layer(c"VK_LAYER_KHRONOS_validation");
//! let instance = builder.build().unwrap();
//! ```
use crate::{Error, utils::Version};
use ash::{prelude::VkResult, vk};
use std::{
    borrow::Cow,
    collections::{BTreeMap, BTreeSet},
    ffi::{CStr, CString, c_char},
    ops::Deref,
    sync::Arc,
};

/// A reference-counted Vulkan instance, destroyed with its last clone.
#[derive(Clone)]
pub struct Instance(Arc<InstanceInner>);
impl PartialEq for Instance {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Instance {}

struct InstanceInner {
    entry: Arc<ash::Entry>,
    instance: ash::Instance,
    extensions: BTreeSet<&'static CStr>,
    debug_utils: Option<ash::ext::debug_utils::Instance>,
    api_version: Version,
}

/// Application metadata and settings used when creating an instance.
pub struct InstanceCreateInfo {
    pub flags: vk::InstanceCreateFlags,
    /// Shown in debugging tools.
    pub application_name: Cow<'static, CStr>,
    pub application_version: Version,
    pub engine_name: Cow<'static, CStr>,
    pub engine_version: Version,
    pub api_version: Version,
}

impl Default for InstanceCreateInfo {
    fn default() -> Self {
        Self {
            flags: vk::InstanceCreateFlags::empty(),
            application_name: Cow::Borrowed(c"Unnamed Application"),
            application_version: Default::default(),
            engine_name: Cow::Borrowed(c"tephra"),
            engine_version: Default::default(),
            api_version: Version::V1_3,
        }
    }
}

impl Instance {
    pub fn builder(entry: Arc<ash::Entry>) -> VkResult<InstanceBuilder> {
        InstanceBuilder::new(entry)
    }

    pub fn entry(&self) -> &Arc<ash::Entry> {
        &self.0.entry
    }

    pub fn extension_enabled(&self, name: &CStr) -> bool {
        self.0.extensions.contains(name)
    }

    /// The `VK_EXT_debug_utils` instance functions, if the extension was enabled.
    pub fn debug_utils(&self) -> Option<&ash::ext::debug_utils::Instance> {
        self.0.debug_utils.as_ref()
    }

    pub fn api_version(&self) -> Version {
        self.0.api_version
    }
}

impl Deref for Instance {
    type Target = ash::Instance;

    fn deref(&self) -> &Self::Target {
        &self.0.instance
    }
}

impl Drop for InstanceInner {
    fn drop(&mut self) {
        tracing::info!(instance = ?self.instance.handle(), "drop instance");
        // Safety: PhysicalDevice and Device hold a clone of the instance, so nothing
        // derived from it is alive at this point.
        unsafe {
            self.instance.destroy_instance(None);
        }
    }
}

/// Properties of an available layer.
#[derive(Clone, Debug)]
pub struct LayerProperties {
    pub spec_version: Version,
    pub implementation_version: Version,
    pub description: String,
}

/// Configures extensions, layers and application metadata before instance creation.
pub struct InstanceBuilder {
    entry: Arc<ash::Entry>,
    available_extensions: BTreeMap<CString, Version>,
    enabled_extensions: BTreeSet<&'static CStr>,

    available_layers: BTreeMap<CString, LayerProperties>,
    enabled_layers: Vec<*const c_char>,

    pub info: InstanceCreateInfo,
}

impl InstanceBuilder {
    /// Enumerates the extensions and layers offered by the loader.
    pub fn new(entry: Arc<ash::Entry>) -> VkResult<Self> {
        let available_extensions = unsafe { entry.enumerate_instance_extension_properties(None) }?
            .into_iter()
            .filter_map(|ext| {
                let name = ext.extension_name_as_c_str().ok()?;
                Some((name.to_owned(), Version(ext.spec_version)))
            })
            .collect::<BTreeMap<CString, Version>>();
        let available_layers = unsafe { entry.enumerate_instance_layer_properties() }?
            .into_iter()
            .filter_map(|layer| {
                let name = layer.layer_name_as_c_str().ok()?;
                let description = layer
                    .description_as_c_str()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                Some((
                    name.to_owned(),
                    LayerProperties {
                        implementation_version: Version(layer.implementation_version),
                        spec_version: Version(layer.spec_version),
                        description,
                    },
                ))
            })
            .collect::<BTreeMap<CString, LayerProperties>>();
        #[allow(unused_mut)]
        let mut this = Self {
            entry,
            available_extensions,
            enabled_extensions: BTreeSet::new(),
            available_layers,
            enabled_layers: Vec::new(),
            info: InstanceCreateInfo::default(),
        };
        #[cfg(target_vendor = "apple")]
        {
            if this
                .enable_extension(ash::khr::portability_enumeration::NAME)
                .is_ok()
            {
                this.info.flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
            }
        }
        Ok(this)
    }

    pub fn extension_available(&self, name: &CStr) -> bool {
        self.available_extensions.contains_key(name)
    }

    pub fn enable_extension(&mut self, name: &'static CStr) -> Result<(), Error> {
        if self.available_extensions.contains_key(name) {
            self.enabled_extensions.insert(name);
            Ok(())
        } else {
            Err(Error::MissingExtension(name))
        }
    }

    /// Enables a layer, making the extensions it provides available.
    ///
    /// Returns `None` if the layer is not installed.
    pub fn enable_layer(&mut self, layer: &'static CStr) -> Option<LayerProperties> {
        let properties = self.available_layers.get(layer)?.clone();
        self.enabled_layers.push(layer.as_ptr());
        match unsafe {
            self.entry
                .enumerate_instance_extension_properties(Some(layer))
        } {
            Ok(additional) => {
                self.available_extensions
                    .extend(additional.into_iter().filter_map(|ext| {
                        let name = ext.extension_name_as_c_str().ok()?;
                        Some((name.to_owned(), Version(ext.spec_version)))
                    }));
            }
            Err(err) => {
                tracing::warn!(?layer, %err, "failed to enumerate layer extensions");
            }
        }
        Some(properties)
    }

    pub fn build(self) -> VkResult<Instance> {
        let application_info = vk::ApplicationInfo::default()
            .application_name(&self.info.application_name)
            .application_version(self.info.application_version.0)
            .engine_name(&self.info.engine_name)
            .engine_version(self.info.engine_version.0)
            .api_version(self.info.api_version.0);

        let enabled_extension_names = self
            .enabled_extensions
            .iter()
            .map(|name| name.as_ptr())
            .collect::<Vec<_>>();
        let create_info = vk::InstanceCreateInfo::default()
            .flags(self.info.flags)
            .application_info(&application_info)
            .enabled_layer_names(&self.enabled_layers)
            .enabled_extension_names(&enabled_extension_names);
        // Safety: No host synchronization rules for vkCreateInstance.
        let instance = unsafe { self.entry.create_instance(&create_info, None)? };
        let debug_utils = self
            .enabled_extensions
            .contains(ash::ext::debug_utils::NAME)
            .then(|| ash::ext::debug_utils::Instance::new(&self.entry, &instance));
        Ok(Instance(Arc::new(InstanceInner {
            entry: self.entry,
            instance,
            extensions: self.enabled_extensions,
            debug_utils,
            api_version: self.info.api_version,
        })))
    }
}
unsafe impl Send for InstanceBuilder {}
unsafe impl Sync for InstanceBuilder {}
