//! Render graph frontend.
//!
//! Passes are declared once; every frame, pass instance requests
//! materialize them against cached transient images and framebuffers. The
//! backend itself stays behind [`RenderBackend`]: the frontend only decides
//! which images alias, which cached objects to reuse, and in which order
//! instances commit.
//!
//! Dependants must be declared before the dependency's instance is
//! requested; the backend treats that ordering as the only source of truth
//! for barrier scheduling.

use fxhash::FxHashMap;
use kiln_base::{define_id_type, IdGenerator, InternedString};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::Arc;

define_id_type! {
    pub struct PassId
}

define_id_type! {
    pub struct PassInstanceId
}

define_id_type! {
    /// Backend image handle; invalid doubles as the failure sentinel.
    pub struct RenderImageId
}

define_id_type! {
    pub struct FramebufferId
}

define_id_type! {
    pub struct SurfaceId
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassType {
    Graphics,
    Compute,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachmentKind {
    Color,
    Depth,
    Input,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Rgba8,
    Bgra8,
    Rgba16F,
    Depth24Stencil8,
    Depth32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadOp {
    Load,
    Clear,
    DontCare,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreOp {
    Store,
    DontCare,
}

#[derive(Clone, Copy, Debug)]
pub struct PassAttachment {
    pub kind: AttachmentKind,
    pub format: ImageFormat,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
}

/// Declarative pass description. Variants name pipeline variations; the
/// frontend carries them through untouched.
#[derive(Clone, Debug)]
pub struct PassDescription {
    pub name: InternedString,
    pub ty: PassType,
    pub attachments: Vec<PassAttachment>,
    pub variants: Vec<InternedString>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClearValue {
    pub color: [f32; 4],
    pub depth: f32,
    pub stencil: u32,
}

impl Default for ClearValue {
    fn default() -> ClearValue {
        ClearValue {
            color: [0.0; 4],
            depth: 1.0,
            stencil: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ViewportBounds {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IntegerRegion {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

//--------------------------------------------------------------------------------------------------

/// Whether a transient image must survive for dependant instances within
/// the frame. Part of the aliasing cache key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageUsage {
    Transient,
    Persistent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TransientImageDescription {
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub usage: ImageUsage,
}

/// Surface the frontend drives. The concrete device lives elsewhere; an
/// invalid handle from any create call means the frame should be skipped.
pub trait RenderBackend: Send + Sync {
    fn create_image(&self, description: &TransientImageDescription) -> RenderImageId;
    fn destroy_image(&self, image: RenderImageId);
    fn create_framebuffer(
        &self,
        pass: PassId,
        width: u32,
        height: u32,
        attachments: &[RenderImageId],
    ) -> FramebufferId;
    fn destroy_framebuffer(&self, framebuffer: FramebufferId);
    fn surface_image(&self, surface: SurfaceId) -> RenderImageId;
    /// Commits the frame's pass instances, sorted in request order.
    fn next_frame(&self, instances: &[PassInstance]);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PassInstanceAttachmentInfo {
    pub use_surface: Option<SurfaceId>,
    pub used_by_dependant_instances: bool,
}

pub struct PassInstanceRequest<'a> {
    pub pass: PassId,
    pub width: u32,
    pub height: u32,
    pub attachment_info: &'a [PassInstanceAttachmentInfo],
    pub dependants: &'a [PassInstanceId],
    pub viewport: ViewportBounds,
    pub scissor: IntegerRegion,
    pub clear_values: &'a [ClearValue],
}

#[derive(Clone, Debug)]
pub struct PassInstance {
    pub id: PassInstanceId,
    pub pass: PassId,
    pub framebuffer: FramebufferId,
    pub attachments: SmallVec<[RenderImageId; 4]>,
    pub viewport: ViewportBounds,
    pub scissor: IntegerRegion,
    pub clear_values: SmallVec<[ClearValue; 4]>,
    pub dependants: SmallVec<[PassInstanceId; 4]>,
}

#[derive(Clone, Debug)]
pub struct PassInstanceAllocation {
    pub instance: PassInstanceId,
    pub attachments: SmallVec<[RenderImageId; 4]>,
}

//--------------------------------------------------------------------------------------------------

struct CachedImage {
    image: RenderImageId,
    last_used_frame: u64,
}

#[derive(PartialEq, Eq, Hash)]
struct FramebufferKey {
    pass: PassId,
    width: u32,
    height: u32,
    attachments: SmallVec<[RenderImageId; 4]>,
}

struct CachedFramebuffer {
    framebuffer: FramebufferId,
    last_used_frame: u64,
}

struct GraphState {
    passes: FxHashMap<PassId, PassDescription>,
    image_cache: FxHashMap<TransientImageDescription, CachedImage>,
    framebuffer_cache: FxHashMap<FramebufferKey, CachedFramebuffer>,
    frame_index: u64,
    instances: Vec<PassInstance>,
}

pub struct RenderGraph {
    backend: Arc<dyn RenderBackend>,
    pass_ids: IdGenerator,
    instance_ids: IdGenerator,
    /// Cache entries untouched for this many frames are destroyed.
    keep_alive_frames: u64,
    state: Mutex<GraphState>,
}

impl RenderGraph {
    pub fn new(backend: Arc<dyn RenderBackend>) -> RenderGraph {
        RenderGraph::with_keep_alive_frames(backend, 2)
    }

    pub fn with_keep_alive_frames(backend: Arc<dyn RenderBackend>, frames: u64) -> RenderGraph {
        RenderGraph {
            backend,
            pass_ids: IdGenerator::new(),
            instance_ids: IdGenerator::new(),
            keep_alive_frames: frames.max(1),
            state: Mutex::new(GraphState {
                passes: FxHashMap::default(),
                image_cache: FxHashMap::default(),
                framebuffer_cache: FxHashMap::default(),
                frame_index: 0,
                instances: Vec::new(),
            }),
        }
    }

    pub fn create_pass(&self, description: PassDescription) -> PassId {
        let id = PassId::from_generator(&self.pass_ids);
        self.state.lock().passes.insert(id, description);
        id
    }

    pub fn frame_index(&self) -> u64 {
        self.state.lock().frame_index
    }

    /// Materializes one pass instance for the current frame. Returns `None`
    /// when a backend allocation failed; the caller skips the frame.
    ///
    /// May be called from multiple mutator tasks in parallel; the caches
    /// sit behind a short lock.
    pub fn request_pass_instance(
        &self,
        request: &PassInstanceRequest,
    ) -> Option<PassInstanceAllocation> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let frame = state.frame_index;

        let pass = match state.passes.get(&request.pass) {
            Some(pass) => pass,
            None => {
                debug_assert!(false, "pass instance requested for unknown pass");
                return None;
            }
        };
        debug_assert_eq!(pass.attachments.len(), request.attachment_info.len());

        let mut attachments: SmallVec<[RenderImageId; 4]> = SmallVec::new();
        for (slot, info) in pass.attachments.iter().zip(request.attachment_info) {
            let image = match info.use_surface {
                Some(surface) => self.backend.surface_image(surface),
                None => {
                    let key = TransientImageDescription {
                        width: request.width,
                        height: request.height,
                        format: slot.format,
                        usage: if info.used_by_dependant_instances {
                            ImageUsage::Persistent
                        } else {
                            ImageUsage::Transient
                        },
                    };
                    match state.image_cache.get_mut(&key) {
                        Some(cached) => {
                            cached.last_used_frame = frame;
                            cached.image
                        }
                        None => {
                            let image = self.backend.create_image(&key);
                            if !image.is_valid() {
                                log::error!("backend failed to allocate a transient image");
                                return None;
                            }
                            state
                                .image_cache
                                .insert(key, CachedImage { image, last_used_frame: frame });
                            image
                        }
                    }
                }
            };
            if !image.is_valid() {
                log::error!("backend returned an invalid attachment image");
                return None;
            }
            attachments.push(image);
        }

        let framebuffer_key = FramebufferKey {
            pass: request.pass,
            width: request.width,
            height: request.height,
            attachments: attachments.clone(),
        };
        let framebuffer = match state.framebuffer_cache.get_mut(&framebuffer_key) {
            Some(cached) => {
                cached.last_used_frame = frame;
                cached.framebuffer
            }
            None => {
                let framebuffer = self.backend.create_framebuffer(
                    request.pass,
                    request.width,
                    request.height,
                    &attachments,
                );
                if !framebuffer.is_valid() {
                    log::error!("backend failed to allocate a framebuffer");
                    return None;
                }
                state.framebuffer_cache.insert(
                    framebuffer_key,
                    CachedFramebuffer {
                        framebuffer,
                        last_used_frame: frame,
                    },
                );
                framebuffer
            }
        };

        let id = PassInstanceId::from_generator(&self.instance_ids);
        state.instances.push(PassInstance {
            id,
            pass: request.pass,
            framebuffer,
            attachments: attachments.clone(),
            viewport: request.viewport,
            scissor: request.scissor,
            clear_values: request.clear_values.iter().copied().collect(),
            dependants: request.dependants.iter().copied().collect(),
        });

        Some(PassInstanceAllocation {
            instance: id,
            attachments,
        })
    }

    /// Commits this frame's pass instances exactly once, then evicts cache
    /// entries that went untouched for the configured number of frames.
    pub fn next_frame(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let instances = std::mem::replace(&mut state.instances, Vec::new());
        self.backend.next_frame(&instances);
        state.frame_index += 1;

        let keep_alive = self.keep_alive_frames;
        let frame = state.frame_index;
        let backend = &self.backend;

        state.framebuffer_cache.retain(|_, cached| {
            let keep = frame - cached.last_used_frame < keep_alive;
            if !keep {
                backend.destroy_framebuffer(cached.framebuffer);
            }
            keep
        });
        state.image_cache.retain(|_, cached| {
            let keep = frame - cached.last_used_frame < keep_alive;
            if !keep {
                backend.destroy_image(cached.image);
            }
            keep
        });
    }
}

impl Drop for RenderGraph {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for (_, cached) in state.framebuffer_cache.drain() {
            self.backend.destroy_framebuffer(cached.framebuffer);
        }
        for (_, cached) in state.image_cache.drain() {
            self.backend.destroy_image(cached.image);
        }
    }
}
