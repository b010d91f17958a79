//! Module and group names addressed on the bus.

pub const CLOUDHUB: &str = "cloudhub";
pub const EDGE_CONTROLLER: &str = "edgecontroller";
pub const DEVICE_CONTROLLER: &str = "devicecontroller";
pub const DYNAMIC_CONTROLLER: &str = "dynamiccontroller";
pub const ROUTER: &str = "router";
pub const TASK_MANAGER: &str = "taskmanager";
pub const POLICY_CONTROLLER: &str = "policycontroller";
pub const SYNC_CONTROLLER: &str = "synccontroller";

pub const GROUP_RESOURCE: &str = "resource";
pub const GROUP_CLOUDHUB: &str = "cloudhub";
pub const GROUP_EDGE_CONTROLLER: &str = "edgecontroller";
pub const GROUP_DYNAMIC_CONTROLLER: &str = "dynamiccontroller";
pub const GROUP_ROUTER: &str = "router";
pub const GROUP_POLICY_CONTROLLER: &str = "policycontroller";
pub const GROUP_META: &str = "meta";

/// Every module the cloud core registers, paired with its group.
pub const ALL: &[(&str, &str)] = &[
    (CLOUDHUB, GROUP_CLOUDHUB),
    (EDGE_CONTROLLER, GROUP_EDGE_CONTROLLER),
    (DEVICE_CONTROLLER, "devicecontroller"),
    (DYNAMIC_CONTROLLER, GROUP_DYNAMIC_CONTROLLER),
    (ROUTER, GROUP_ROUTER),
    (TASK_MANAGER, "taskmanager"),
    (POLICY_CONTROLLER, GROUP_POLICY_CONTROLLER),
    (SYNC_CONTROLLER, "synccontroller"),
];
