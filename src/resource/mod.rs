// Resource management
//
// Resources (textures, fonts) load asynchronously on a pool of loader
// threads. Each resource is pinned to one loader thread; its load and
// unload tasks run there so thread private vulkan objects (command
// pools, descriptor pools, the freetype instance) never cross
// threads.

pub mod font;
pub mod texture;

use ash::vk;
use freetype as ft;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::device::Device;
use crate::mesh::Color8;
use crate::thread_pool::{ThreadItem, ThreadPool};
use crate::{Result, SquallError};

use font::{FontCreateInfo, FontResource};
use texture::TextureResource;

/// Lifecycle state of a resource as observed by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceStatus {
    /// Load still in flight, poll again later.
    Undetermined,
    Loaded,
    FailedToLoad,
    /// The resource exists but cannot currently be used.
    Unavailable,
}

/// One-shot event marking that a loader thread finished running the
/// load function, successfully or not. Lets callers distinguish "not
/// started" from "failed".
#[doc(hidden)]
pub struct LoadFence {
    lf_state: Mutex<bool>,
    lf_cond: Condvar,
}

impl LoadFence {
    fn new() -> Self {
        LoadFence {
            lf_state: Mutex::new(false),
            lf_cond: Condvar::new(),
        }
    }

    pub fn set(&self) {
        let mut state = self.lf_state.lock().unwrap();
        *state = true;
        self.lf_cond.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.lf_state.lock().unwrap()
    }

    /// Wait for the fence, up to `timeout` if one is given. Returns
    /// whether the fence was set.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut state = self.lf_state.lock().unwrap();
        match timeout {
            None => {
                while !*state {
                    state = self.lf_cond.wait(state).unwrap();
                }
                true
            }
            Some(limit) => {
                let deadline = Instant::now() + limit;
                while !*state {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (s, _) = self.lf_cond.wait_timeout(state, deadline - now).unwrap();
                    state = s;
                }
                true
            }
        }
    }
}

/// State every resource carries: the load fence, the load outcome,
/// the owning loader thread, parent/child links and source paths.
#[doc(hidden)]
pub struct ResourceCommon {
    rc_load_fence: LoadFence,
    rc_load_ok: AtomicBool,
    rc_loader_thread: usize,
    rc_is_subresource: bool,
    rc_subresources: Mutex<Vec<Arc<dyn Resource>>>,
    rc_file_paths: Vec<PathBuf>,
    rc_is_from_file: bool,
}

impl ResourceCommon {
    pub fn new(loader_thread: usize, is_subresource: bool, file_paths: Vec<PathBuf>) -> Self {
        let is_from_file = !file_paths.is_empty();
        ResourceCommon {
            rc_load_fence: LoadFence::new(),
            rc_load_ok: AtomicBool::new(false),
            rc_loader_thread: loader_thread,
            rc_is_subresource: is_subresource,
            rc_subresources: Mutex::new(Vec::new()),
            rc_file_paths: file_paths,
            rc_is_from_file: is_from_file,
        }
    }

    pub fn loader_thread(&self) -> usize {
        self.rc_loader_thread
    }

    pub fn load_fence(&self) -> &LoadFence {
        &self.rc_load_fence
    }

    pub fn load_ok(&self) -> bool {
        self.rc_load_ok.load(Ordering::Acquire)
    }

    pub fn finish_load(&self, ok: bool) {
        self.rc_load_ok.store(ok, Ordering::Release);
        self.rc_load_fence.set();
    }

    pub fn add_subresource(&self, resource: Arc<dyn Resource>) {
        self.rc_subresources.lock().unwrap().push(resource);
    }

    pub fn take_subresources(&self) -> Vec<Arc<dyn Resource>> {
        self.rc_subresources.lock().unwrap().drain(..).collect()
    }
}

/// Common interface of every loadable resource.
pub trait Resource: Send + Sync {
    /// Current lifecycle status. Never blocks.
    fn status(&self) -> ResourceStatus;

    /// Block until the resource is loaded or failed, bounded by
    /// `timeout` when one is given. Returns the status observed last.
    fn wait_until_loaded(&self, timeout: Option<Duration>) -> ResourceStatus {
        if !self.common().load_fence().wait(timeout) {
            return ResourceStatus::Undetermined;
        }
        // The load function has run; poll until any GPU-side work is
        // observed complete as well.
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let status = self.status();
            if status != ResourceStatus::Undetermined {
                return status;
            }
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return status;
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn is_from_file(&self) -> bool {
        self.common().rc_is_from_file
    }

    fn file_paths(&self) -> &[PathBuf] {
        &self.common().rc_file_paths
    }

    #[doc(hidden)]
    fn common(&self) -> &ResourceCommon;

    /// Runs on the resource's loader thread. Returns whether the load
    /// function succeeded; GPU completion is tracked separately.
    #[doc(hidden)]
    fn mt_load(&self, thread_resource: &mut ThreadLoaderResource) -> bool;

    /// Runs on the resource's loader thread during destruction.
    #[doc(hidden)]
    fn mt_unload(&self, thread_resource: &mut ThreadLoaderResource);
}

/// The freetype handle is only ever touched from the worker thread
/// that created it in `thread_begin`.
struct FtLibrary(ft::Library);
unsafe impl Send for FtLibrary {}

/// Vulkan and freetype state private to one loader thread.
#[doc(hidden)]
pub struct ThreadLoaderResource {
    tl_dev: Arc<Device>,
    tl_thread_index: usize,
    tl_primary_render_pool: vk::CommandPool,
    tl_secondary_render_pool: vk::CommandPool,
    tl_primary_transfer_pool: vk::CommandPool,
    tl_descpool: Option<crate::descpool::DescriptorAutoPool>,
    tl_freetype: Option<FtLibrary>,
}

impl ThreadLoaderResource {
    fn new(dev: Arc<Device>) -> Self {
        ThreadLoaderResource {
            tl_dev: dev,
            tl_thread_index: usize::MAX,
            tl_primary_render_pool: vk::CommandPool::null(),
            tl_secondary_render_pool: vk::CommandPool::null(),
            tl_primary_transfer_pool: vk::CommandPool::null(),
            tl_descpool: None,
            tl_freetype: None,
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.tl_dev
    }

    pub fn thread_index(&self) -> usize {
        self.tl_thread_index
    }

    pub fn primary_render_pool(&self) -> vk::CommandPool {
        self.tl_primary_render_pool
    }

    pub fn secondary_render_pool(&self) -> vk::CommandPool {
        self.tl_secondary_render_pool
    }

    pub fn primary_transfer_pool(&self) -> vk::CommandPool {
        self.tl_primary_transfer_pool
    }

    pub fn descpool(&mut self) -> &mut crate::descpool::DescriptorAutoPool {
        self.tl_descpool
            .as_mut()
            .expect("loader thread descriptor pool missing")
    }

    pub fn freetype(&self) -> Option<&ft::Library> {
        self.tl_freetype.as_ref().map(|l| &l.0)
    }
}

impl ThreadItem for ThreadLoaderResource {
    fn thread_begin(&mut self, thread_index: usize) -> Result<()> {
        self.tl_thread_index = thread_index;

        let flags = vk::CommandPoolCreateFlags::TRANSIENT;
        self.tl_primary_render_pool = self.tl_dev.create_command_pool(
            self.tl_dev.d_queues.primary_render.queue_family_index(),
            flags,
        )?;
        self.tl_secondary_render_pool = self.tl_dev.create_command_pool(
            self.tl_dev.d_queues.secondary_render.queue_family_index(),
            flags,
        )?;
        self.tl_primary_transfer_pool = self.tl_dev.create_command_pool(
            self.tl_dev.d_queues.primary_transfer.queue_family_index(),
            flags,
        )?;

        self.tl_descpool = Some(crate::descpool::DescriptorAutoPool::new(
            self.tl_dev.d_dev.clone(),
        ));

        let freetype = ft::Library::init().map_err(|e| {
            log::error!("could not initialize freetype on a loader thread: {}", e);
            SquallError::RESOURCE_LOAD_FAILED
        })?;
        self.tl_freetype = Some(FtLibrary(freetype));
        Ok(())
    }

    fn thread_end(&mut self) {
        // Vulkan objects loader tasks produced may still be in flight.
        self.tl_dev.wait_idle();
        unsafe {
            let dev = &self.tl_dev.d_dev;
            if self.tl_primary_render_pool != vk::CommandPool::null() {
                dev.destroy_command_pool(self.tl_primary_render_pool, None);
            }
            if self.tl_secondary_render_pool != vk::CommandPool::null() {
                dev.destroy_command_pool(self.tl_secondary_render_pool, None);
            }
            if self.tl_primary_transfer_pool != vk::CommandPool::null() {
                dev.destroy_command_pool(self.tl_primary_transfer_pool, None);
            }
        }
        if let Some(mut pool) = self.tl_descpool.take() {
            pool.destroy();
        }
        self.tl_freetype = None;
    }
}

/// Owns all loadable resources and the loader thread pool. Loader
/// threads are assigned round robin as resources are created.
pub struct ResourceManager {
    rm_dev: Arc<Device>,
    rm_pool: ThreadPool<ThreadLoaderResource>,
    rm_resources: Mutex<Vec<Arc<dyn Resource>>>,
    /// File-backed textures already loaded, so repeated loads of the
    /// same paths share one resource.
    rm_texture_cache: Mutex<Vec<(Vec<PathBuf>, Weak<TextureResource>)>>,
    rm_next_loader: AtomicUsize,
}

impl ResourceManager {
    pub(crate) fn new(dev: Arc<Device>, loader_thread_count: usize) -> Result<Arc<Self>> {
        let count = loader_thread_count.max(1);
        let resources = (0..count).map(|_| ThreadLoaderResource::new(dev.clone())).collect();
        let pool = ThreadPool::new(resources)?;

        Ok(Arc::new(ResourceManager {
            rm_dev: dev,
            rm_pool: pool,
            rm_resources: Mutex::new(Vec::new()),
            rm_texture_cache: Mutex::new(Vec::new()),
            rm_next_loader: AtomicUsize::new(0),
        }))
    }

    pub(crate) fn device(&self) -> &Arc<Device> {
        &self.rm_dev
    }

    fn select_loader_thread(&self) -> usize {
        self.rm_next_loader.fetch_add(1, Ordering::Relaxed) % self.rm_pool.thread_count()
    }

    fn register_and_schedule(self: &Arc<Self>, resource: Arc<dyn Resource>) {
        self.rm_resources.lock().unwrap().push(resource.clone());

        let loader = resource.common().loader_thread();
        self.rm_pool.schedule_task(vec![loader], Vec::new(), move |tlr| {
            let ok = resource.mt_load(tlr);
            resource.common().finish_load(ok);
        });
    }

    /// Load an array texture from image files, one file per layer.
    /// All layers must share the same extent. Loading the same path
    /// set twice returns the already loaded resource.
    pub fn load_texture(self: &Arc<Self>, paths: Vec<PathBuf>) -> Result<Arc<TextureResource>> {
        if paths.is_empty() {
            return Err(SquallError::INVALID_CREATE_INFO);
        }

        {
            let mut cache = self.rm_texture_cache.lock().unwrap();
            cache.retain(|(_, weak)| weak.strong_count() > 0);
            if let Some((_, existing)) = cache.iter().find(|(p, _)| *p == paths) {
                if let Some(strong) = existing.upgrade() {
                    return Ok(strong);
                }
            }
        }

        let resource = Arc::new(TextureResource::from_files(
            Arc::downgrade(self),
            self.select_loader_thread(),
            paths.clone(),
        ));
        self.rm_texture_cache
            .lock()
            .unwrap()
            .push((paths, Arc::downgrade(&resource)));
        resource.set_self(Arc::downgrade(&resource));
        self.register_and_schedule(resource.clone());
        Ok(resource)
    }

    /// Create an array texture from raw RGBA8 pixel layers.
    pub fn create_texture(
        self: &Arc<Self>,
        size: (u32, u32),
        pixel_layers: Vec<Vec<Color8>>,
    ) -> Result<Arc<TextureResource>> {
        self.create_texture_internal(size, pixel_layers, None)
    }

    pub(crate) fn create_texture_internal(
        self: &Arc<Self>,
        size: (u32, u32),
        pixel_layers: Vec<Vec<Color8>>,
        parent: Option<&dyn Resource>,
    ) -> Result<Arc<TextureResource>> {
        if pixel_layers.is_empty()
            || pixel_layers
                .iter()
                .any(|l| l.len() != (size.0 * size.1) as usize)
        {
            return Err(SquallError::INVALID_CREATE_INFO);
        }

        // Subresources stay on their parent's loader thread so the
        // parent's unload can release them in order.
        let loader = match parent {
            Some(p) => p.common().loader_thread(),
            None => self.select_loader_thread(),
        };
        let resource = Arc::new(TextureResource::from_pixels(
            Arc::downgrade(self),
            loader,
            size,
            pixel_layers,
            parent.is_some(),
        ));
        resource.set_self(Arc::downgrade(&resource));
        if let Some(p) = parent {
            p.common().add_subresource(resource.clone());
        }
        self.register_and_schedule(resource.clone());
        Ok(resource)
    }

    /// Load a font and generate its glyph atlases.
    pub fn load_font(
        self: &Arc<Self>,
        path: PathBuf,
        info: FontCreateInfo,
    ) -> Result<Arc<FontResource>> {
        let resource = Arc::new(FontResource::from_file(
            Arc::downgrade(self),
            self.select_loader_thread(),
            path,
            info,
        ));
        self.register_and_schedule(resource.clone());
        Ok(resource)
    }

    /// Schedule a cleanup task on `loader_thread`. Used by resources
    /// whose load has completed on the GPU and whose staging state can
    /// now be destroyed.
    pub(crate) fn schedule_cleanup<F>(&self, loader_thread: usize, func: F)
    where
        F: FnOnce(&mut ThreadLoaderResource) + Send + 'static,
    {
        self.rm_pool.schedule_task(vec![loader_thread], Vec::new(), func);
    }

    /// Destroy a resource: wait until it is determined, destroy its
    /// subresources, then run its unload on the owning loader thread.
    pub fn destroy_resource(self: &Arc<Self>, resource: Arc<dyn Resource>) {
        resource.wait_until_loaded(None);

        for sub in resource.common().take_subresources() {
            self.destroy_resource(sub);
        }

        self.rm_resources
            .lock()
            .unwrap()
            .retain(|r| !Arc::ptr_eq(r, &resource));

        let loader = resource.common().loader_thread();
        self.rm_pool.schedule_task(vec![loader], Vec::new(), move |tlr| {
            resource.mt_unload(tlr);
            drop(resource);
        });
    }

    /// Tear everything down: wait for every resource to become
    /// determined, unload them all, and drain the loader pool.
    pub(crate) fn destroy(self: &Arc<Self>) {
        loop {
            let pending = {
                let resources = self.rm_resources.lock().unwrap();
                resources
                    .iter()
                    .any(|r| r.status() == ResourceStatus::Undetermined)
            };
            if !pending {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        let resources: Vec<Arc<dyn Resource>> =
            self.rm_resources.lock().unwrap().drain(..).collect();
        for resource in resources {
            let loader = resource.common().loader_thread();
            self.rm_pool.schedule_task(vec![loader], Vec::new(), move |tlr| {
                resource.mt_unload(tlr);
                drop(resource);
            });
        }
        self.rm_pool.wait_idle();
    }
}

/// A weak handle a resource keeps back to its manager.
pub(crate) type ManagerRef = Weak<ResourceManager>;
