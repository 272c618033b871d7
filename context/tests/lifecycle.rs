use kiln_base::{intern, AllocationGroup};
use kiln_context::{Context, System, SystemApi, SystemCreateContext, SystemRegistry};
use parking_lot::Mutex;
use std::sync::Arc;

type SharedLog = Arc<Mutex<Vec<String>>>;

fn shared_log(context: &SystemCreateContext) -> SharedLog {
    context.config_as::<SharedLog>().expect("log config missing").clone()
}

//--------------------------------------------------------------------------------------------------

struct AlphaSystem {
    log: SharedLog,
}

impl System for AlphaSystem {
    fn init(&self, context: &Context) {
        // Logical dependency: beta must be initialized first and torn down
        // after us.
        context.query(intern("beta_system"));
        self.log.lock().push("init alpha".into());
    }

    fn shutdown(&self, _context: &Context) {
        self.log.lock().push("shutdown alpha".into());
    }
}

fn create_alpha(context: &SystemCreateContext) -> Arc<dyn System> {
    let log = shared_log(context);
    log.lock().push("create alpha".into());
    Arc::new(AlphaSystem { log })
}

struct BetaSystem {
    log: SharedLog,
}

impl System for BetaSystem {
    fn init(&self, _context: &Context) {
        self.log.lock().push("init beta".into());
    }

    fn shutdown(&self, _context: &Context) {
        self.log.lock().push("shutdown beta".into());
    }
}

fn create_beta(context: &SystemCreateContext) -> Arc<dyn System> {
    let log = shared_log(context);
    log.lock().push("create beta".into());
    Arc::new(BetaSystem { log })
}

static ALPHA_API: SystemApi = SystemApi {
    name: "alpha_system",
    create: create_alpha,
};
static BETA_API: SystemApi = SystemApi {
    name: "beta_system",
    create: create_beta,
};

//--------------------------------------------------------------------------------------------------

struct GammaSystem {
    log: SharedLog,
}

impl System for GammaSystem {
    fn connect(&self, context: &Context) {
        context.query(intern("delta_system"));
        self.log.lock().push("connect gamma".into());
    }
}

fn create_gamma(context: &SystemCreateContext) -> Arc<dyn System> {
    Arc::new(GammaSystem { log: shared_log(context) })
}

struct DeltaSystem {
    log: SharedLog,
}

impl System for DeltaSystem {
    fn connect(&self, context: &Context) {
        // Would-be cycle with gamma: we only need the handle, not a
        // connection, so break it with the no-connect query.
        let gamma = context.query_no_connect(intern("gamma_system"));
        assert!(gamma.is_some());
        self.log.lock().push("connect delta".into());
    }
}

fn create_delta(context: &SystemCreateContext) -> Arc<dyn System> {
    Arc::new(DeltaSystem { log: shared_log(context) })
}

static GAMMA_API: SystemApi = SystemApi {
    name: "gamma_system",
    create: create_gamma,
};
static DELTA_API: SystemApi = SystemApi {
    name: "delta_system",
    create: create_delta,
};

//--------------------------------------------------------------------------------------------------

fn test_group(name: &str) -> AllocationGroup {
    AllocationGroup::root().get_or_create_child(intern(name))
}

#[test]
fn three_phase_assembly_orders_init_and_shutdown() {
    let registry = SystemRegistry::new(&[&ALPHA_API, &BETA_API]).unwrap();
    let log: SharedLog = Arc::new(Mutex::new(Vec::new()));

    {
        let context = Context::new(registry, test_group("lifecycle_order"));
        assert!(context.request_system("beta_system", Some(Box::new(log.clone()))));
        assert!(context.request_system("alpha_system", Some(Box::new(log.clone()))));
        assert!(context.is_requested("alpha_system"));
        context.assembly();

        assert!(context.query_typed::<AlphaSystem>("alpha_system").is_some());
        assert!(context.query(intern("unknown_system")).is_none());
    }

    let events = log.lock().clone();
    assert_eq!(
        events,
        vec![
            // Creation in request order.
            "create beta",
            "create alpha",
            // Alpha queried beta during init, so beta initializes first.
            "init beta",
            "init alpha",
            // Teardown reverses the logical dependency.
            "shutdown alpha",
            "shutdown beta",
        ]
    );
}

#[test]
fn connect_cycle_broken_with_query_no_connect() {
    let registry = SystemRegistry::new(&[&GAMMA_API, &DELTA_API]).unwrap();
    let log: SharedLog = Arc::new(Mutex::new(Vec::new()));

    let context = Context::new(registry, test_group("lifecycle_cycle"));
    context.request_system("gamma_system", Some(Box::new(log.clone())));
    context.request_system("delta_system", Some(Box::new(log.clone())));
    context.assembly();

    // Gamma's connect pulled delta in first.
    assert_eq!(log.lock().clone(), vec!["connect delta", "connect gamma"]);
}

#[test]
fn repeated_request_creates_system_once() {
    let registry = SystemRegistry::new(&[&BETA_API]).unwrap();
    let log: SharedLog = Arc::new(Mutex::new(Vec::new()));

    let context = Context::new(registry, test_group("lifecycle_idempotent"));
    assert!(context.request_system("beta_system", Some(Box::new(log.clone()))));
    assert!(context.request_system("beta_system", None));
    context.assembly();

    let creations = log.lock().iter().filter(|event| event.as_str() == "create beta").count();
    assert_eq!(creations, 1);
}

#[test]
fn duplicate_registry_names_are_rejected() {
    assert!(SystemRegistry::new(&[&BETA_API, &BETA_API]).is_err());
}

#[test]
fn unknown_request_is_reported() {
    let registry = SystemRegistry::new(&[&BETA_API]).unwrap();
    let context = Context::new(registry, test_group("lifecycle_unknown"));
    assert!(!context.request_system("missing_system", None));
}
