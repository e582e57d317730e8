use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, EnvVar, SecurityContext, VolumeMount,
};

use super::{requests_and_limits, shell, ControlScript, ExitPolicy, JOB_DIR, LEARNER, PULL_POLICY};
use crate::cluster::snapshot::GPU_RESOURCE;
use crate::env::MountedStores;
use crate::job::JobDeploymentRequest;
use crate::sizing::{byte_quantity, count_quantity, cpu_quantity, milli_cpu, to_bytes};

/// Port learners reach each other on over SSH.
pub const SSH_PORT: i32 = 22;
/// Port distributed workers talk on.
pub const WORKER_PORT: i32 = 2222;

const DROPPED_CAPABILITIES: [&str; 9] = [
    "CHOWN",
    "DAC_OVERRIDE",
    "FOWNER",
    "FSETID",
    "KILL",
    "SETPCAP",
    "NET_RAW",
    "MKNOD",
    "SETFCAP",
];

const UNSET_PLATFORM_VARS: &str = "for i in ${!ALERTMANAGER*} ${!DLAAS*} ${!ETCD*} ${!GRAFANA*} ${!HOSTNAME*} ${!KUBERNETES*} ${!MONGO*} ${!PUSHGATEWAY*}; do unset $i; done;";

/// What the learner container is built from.
#[derive(Clone, Debug)]
pub struct LearnerSpec<'a> {
    /// The job
    pub request: &'a JobDeploymentRequest,
    /// The resolved learner image
    pub image: String,
    /// The learner's variables
    pub env: Vec<EnvVar>,
    /// Shared, data and SSH mounts
    pub mounts: Vec<VolumeMount>,
    /// Which data stores are mounted directly
    pub mounted: MountedStores,
}

fn training_command(mounted: MountedStores) -> String {
    if mounted.results {
        format!(
            "{} export RESULT_DIR=$RESULT_DIR/$TRAINING_ID && mkdir -p $RESULT_DIR/learner-$LEARNER_ID; bash -c 'train.sh 2>&1 | tee -a $RESULT_DIR/learner-$LEARNER_ID/training-logs.txt {}/latest-log; exit ${{PIPESTATUS[0]}}'",
            UNSET_PLATFORM_VARS, JOB_DIR
        )
    } else {
        format!(
            "{} mkdir -p $RESULT_DIR; bash -c 'train.sh 2>&1 | tee -a {}/latest-log; exit ${{PIPESTATUS[0]}}'",
            UNSET_PLATFORM_VARS, JOB_DIR
        )
    }
}

/// The learner container. Training output is teed into the shared job directory, and into the
/// results bucket as well when it is mounted; in that case the exit code is recorded only if
/// nothing else recorded one first.
pub fn learner(spec: LearnerSpec<'_>) -> Container {
    let policy = if spec.mounted.results {
        ExitPolicy::IfAbsent
    } else {
        ExitPolicy::Always
    };
    let script = ControlScript::new(LEARNER, JOB_DIR, training_command(spec.mounted))
        .exit_policy(policy);

    let r = &spec.request.resources;
    let mut resources = BTreeMap::new();
    resources.insert("cpu".to_string(), cpu_quantity(milli_cpu(r.cpus)));
    resources.insert(
        "memory".to_string(),
        byte_quantity(to_bytes(r.memory, r.memory_unit)),
    );
    resources.insert(
        GPU_RESOURCE.to_string(),
        count_quantity(r.gpus.max(0.0) as i64),
    );

    Container {
        name: LEARNER.to_string(),
        image: Some(spec.image),
        image_pull_policy: Some(PULL_POLICY.to_string()),
        command: Some(shell("bash", script.render())),
        env: Some(spec.env),
        ports: Some(
            [SSH_PORT, WORKER_PORT]
                .iter()
                .map(|p| ContainerPort {
                    container_port: *p,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                })
                .collect(),
        ),
        resources: Some(requests_and_limits(resources)),
        volume_mounts: Some(spec.mounts),
        security_context: Some(SecurityContext {
            capabilities: Some(Capabilities {
                add: None,
                drop: Some(DROPPED_CAPABILITIES.iter().map(|c| c.to_string()).collect()),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::job::ResourceRequirements;
    use crate::sizing::SizeUnit;

    fn request() -> JobDeploymentRequest {
        JobDeploymentRequest {
            training_id: "training-1".into(),
            name: "job".into(),
            resources: ResourceRequirements {
                cpus: 1.5,
                memory: 2.0,
                memory_unit: SizeUnit::GiB,
                gpus: 2.0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn build(mounted: MountedStores) -> Container {
        let req = request();
        learner(LearnerSpec {
            request: &req,
            image: "docker.io/ffdl/tensorflow_gpu_1.5:latest".into(),
            env: vec![],
            mounts: vec![],
            mounted,
        })
    }

    #[test]
    fn learner_resources_and_hardening() {
        let c = build(MountedStores::default());
        let resources = c.resources.unwrap();
        let requests = resources.requests.clone().unwrap();
        assert_eq!(resources.requests, resources.limits);
        assert_eq!(requests["cpu"].0, "1500m");
        assert_eq!(requests["nvidia.com/gpu"].0, "2");
        assert_eq!(
            requests["memory"].0,
            to_bytes(2.0, SizeUnit::GiB).to_string()
        );
        let ports: Vec<i32> = c.ports.unwrap().iter().map(|p| p.container_port).collect();
        assert_eq!(ports, vec![22, 2222]);
        let dropped = c.security_context.unwrap().capabilities.unwrap().drop.unwrap();
        assert_eq!(dropped.len(), 9);
        assert!(dropped.contains(&"NET_RAW".to_string()));
    }

    #[test]
    fn command_depends_on_mounted_results() {
        let plain = build(MountedStores::default());
        let script = &plain.command.as_ref().unwrap()[2];
        assert!(script.contains("mkdir -p $RESULT_DIR; bash -c 'train.sh 2>&1 | tee -a /job/latest-log; exit ${PIPESTATUS[0]}'"));
        assert!(script.contains("echo $? > /job/learner.exit"));

        let mounted = build(MountedStores {
            training_data: false,
            results: true,
        });
        let script = &mounted.command.as_ref().unwrap()[2];
        assert!(script.contains("export RESULT_DIR=$RESULT_DIR/$TRAINING_ID"));
        assert!(script.contains("$RESULT_DIR/learner-$LEARNER_ID/training-logs.txt /job/latest-log"));
        assert!(script.contains("if [ ! -f /job/learner.exit ]"));
        assert!(script.starts_with("if [ -f /job/learner.exit ]"));
    }
}
