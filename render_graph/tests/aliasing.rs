use kiln_base::intern;
use kiln_render_graph::{
    AttachmentKind, ClearValue, FramebufferId, ImageFormat, IntegerRegion, LoadOp, PassAttachment,
    PassDescription, PassId, PassInstance, PassInstanceAttachmentInfo, PassInstanceRequest,
    PassType, RenderBackend, RenderGraph, RenderImageId, StoreOp, SurfaceId,
    TransientImageDescription, ViewportBounds,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

//--------------------------------------------------------------------------------------------------

#[derive(Default)]
struct CountingBackend {
    next_handle: AtomicU32,
    images_created: AtomicUsize,
    images_destroyed: AtomicUsize,
    framebuffers_created: AtomicUsize,
    framebuffers_destroyed: AtomicUsize,
    committed: Mutex<Vec<Vec<PassInstance>>>,
}

impl CountingBackend {
    fn new() -> Arc<CountingBackend> {
        Arc::new(CountingBackend {
            next_handle: AtomicU32::new(1),
            ..CountingBackend::default()
        })
    }

    fn handle(&self) -> u32 {
        self.next_handle.fetch_add(1, Ordering::SeqCst)
    }
}

impl RenderBackend for CountingBackend {
    fn create_image(&self, _description: &TransientImageDescription) -> RenderImageId {
        self.images_created.fetch_add(1, Ordering::SeqCst);
        RenderImageId::from_raw(self.handle())
    }

    fn destroy_image(&self, _image: RenderImageId) {
        self.images_destroyed.fetch_add(1, Ordering::SeqCst);
    }

    fn create_framebuffer(
        &self,
        _pass: PassId,
        _width: u32,
        _height: u32,
        _attachments: &[RenderImageId],
    ) -> FramebufferId {
        self.framebuffers_created.fetch_add(1, Ordering::SeqCst);
        FramebufferId::from_raw(self.handle())
    }

    fn destroy_framebuffer(&self, _framebuffer: FramebufferId) {
        self.framebuffers_destroyed.fetch_add(1, Ordering::SeqCst);
    }

    fn surface_image(&self, surface: SurfaceId) -> RenderImageId {
        // One stable image per surface.
        RenderImageId::from_raw(1000 + surface.raw())
    }

    fn next_frame(&self, instances: &[PassInstance]) {
        self.committed.lock().push(instances.to_vec());
    }
}

//--------------------------------------------------------------------------------------------------

fn color_pass(graph: &RenderGraph, name: &str) -> PassId {
    graph.create_pass(PassDescription {
        name: intern(name),
        ty: PassType::Graphics,
        attachments: vec![PassAttachment {
            kind: AttachmentKind::Color,
            format: ImageFormat::Rgba8,
            load_op: LoadOp::Clear,
            store_op: StoreOp::Store,
        }],
        variants: Vec::new(),
    })
}

fn request<'a>(
    pass: PassId,
    attachment_info: &'a [PassInstanceAttachmentInfo],
    dependants: &'a [kiln_render_graph::PassInstanceId],
) -> PassInstanceRequest<'a> {
    PassInstanceRequest {
        pass,
        width: 800,
        height: 600,
        attachment_info,
        dependants,
        viewport: ViewportBounds {
            x: 0.0,
            y: 0.0,
            width: 800.0,
            height: 600.0,
            min_depth: 0.0,
            max_depth: 1.0,
        },
        scissor: IntegerRegion {
            x: 0,
            y: 0,
            width: 800,
            height: 600,
        },
        clear_values: &[],
    }
}

const TRANSIENT: PassInstanceAttachmentInfo = PassInstanceAttachmentInfo {
    use_surface: None,
    used_by_dependant_instances: false,
};

#[test]
fn identical_transient_requests_share_one_image() {
    let backend = CountingBackend::new();
    let graph = RenderGraph::new(backend.clone());
    let pass_a = color_pass(&graph, "scene");
    let pass_b = color_pass(&graph, "post");

    let info = [TRANSIENT];
    let first = graph.request_pass_instance(&request(pass_a, &info, &[])).unwrap();
    let second = graph.request_pass_instance(&request(pass_b, &info, &[])).unwrap();

    // Same {w, h, format, usage}: the second lookup hits the cache.
    assert_eq!(first.attachments[0], second.attachments[0]);
    assert_eq!(backend.images_created.load(Ordering::SeqCst), 1);
    // Different passes still mean different framebuffers.
    assert_eq!(backend.framebuffers_created.load(Ordering::SeqCst), 2);
}

#[test]
fn dependant_usage_changes_the_aliasing_key() {
    let backend = CountingBackend::new();
    let graph = RenderGraph::new(backend.clone());
    let pass = color_pass(&graph, "scene");

    let transient = [TRANSIENT];
    let persistent = [PassInstanceAttachmentInfo {
        use_surface: None,
        used_by_dependant_instances: true,
    }];
    let first = graph.request_pass_instance(&request(pass, &transient, &[])).unwrap();
    let second = graph.request_pass_instance(&request(pass, &persistent, &[])).unwrap();

    assert_ne!(first.attachments[0], second.attachments[0]);
    assert_eq!(backend.images_created.load(Ordering::SeqCst), 2);
}

#[test]
fn cache_entries_survive_one_idle_frame_then_evict() {
    let backend = CountingBackend::new();
    let graph = RenderGraph::new(backend.clone());
    let pass_a = color_pass(&graph, "scene");
    let pass_b = color_pass(&graph, "post");

    let info = [TRANSIENT];
    graph.request_pass_instance(&request(pass_a, &info, &[])).unwrap();
    graph.request_pass_instance(&request(pass_b, &info, &[])).unwrap();

    graph.next_frame();
    // Retained for one idle frame.
    assert_eq!(backend.framebuffers_destroyed.load(Ordering::SeqCst), 0);
    assert_eq!(backend.images_destroyed.load(Ordering::SeqCst), 0);

    graph.next_frame();
    // Untouched for two frames: evicted.
    assert_eq!(backend.framebuffers_destroyed.load(Ordering::SeqCst), 2);
    assert_eq!(backend.images_destroyed.load(Ordering::SeqCst), 1);
}

#[test]
fn touched_entries_are_kept_alive() {
    let backend = CountingBackend::new();
    let graph = RenderGraph::new(backend.clone());
    let pass = color_pass(&graph, "scene");
    let info = [TRANSIENT];

    for _ in 0..4 {
        graph.request_pass_instance(&request(pass, &info, &[])).unwrap();
        graph.next_frame();
    }

    assert_eq!(backend.images_created.load(Ordering::SeqCst), 1);
    assert_eq!(backend.images_destroyed.load(Ordering::SeqCst), 0);
}

#[test]
fn surface_slots_bind_the_surface_image() {
    let backend = CountingBackend::new();
    let graph = RenderGraph::new(backend.clone());
    let pass = color_pass(&graph, "present");

    let info = [PassInstanceAttachmentInfo {
        use_surface: Some(SurfaceId::from_raw(3)),
        used_by_dependant_instances: false,
    }];
    let allocation = graph.request_pass_instance(&request(pass, &info, &[])).unwrap();

    assert_eq!(allocation.attachments[0], RenderImageId::from_raw(1003));
    assert_eq!(backend.images_created.load(Ordering::SeqCst), 0);
}

#[test]
fn instances_commit_once_per_frame_in_request_order() {
    let backend = CountingBackend::new();
    let graph = RenderGraph::new(backend.clone());
    let pass = color_pass(&graph, "scene");
    let info = [TRANSIENT];

    let first = graph.request_pass_instance(&request(pass, &info, &[])).unwrap();
    // The dependant is declared before the dependency's instance request.
    let dependants = [first.instance];
    let second = graph.request_pass_instance(&request(pass, &info, &dependants)).unwrap();

    graph.next_frame();
    graph.next_frame();

    let committed = backend.committed.lock();
    assert_eq!(committed.len(), 2);
    assert_eq!(committed[0].len(), 2);
    assert!(committed[1].is_empty());
    assert_eq!(committed[0][0].id, first.instance);
    assert_eq!(committed[0][1].id, second.instance);
    assert_eq!(committed[0][1].dependants.as_slice(), &dependants);
}

#[test]
fn parallel_requests_agree_on_the_cached_image() {
    let backend = CountingBackend::new();
    let graph = Arc::new(RenderGraph::new(backend.clone()));
    let pass = color_pass(&graph, "scene");

    let mut workers = Vec::new();
    for _ in 0..4 {
        let graph = graph.clone();
        workers.push(std::thread::spawn(move || {
            let info = [TRANSIENT];
            graph
                .request_pass_instance(&request(pass, &info, &[]))
                .unwrap()
                .attachments[0]
        }));
    }

    let images: Vec<_> = workers.into_iter().map(|worker| worker.join().unwrap()).collect();
    assert!(images.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(backend.images_created.load(Ordering::SeqCst), 1);
}
