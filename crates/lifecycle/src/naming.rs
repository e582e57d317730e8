//! Names of every cluster object created for a job.
//!
//! Names are looked up again during status polling and deletion, so each one is a pure function
//! of the job name and, for learners, the learner index.

/// The name of one learner pod.
pub fn learner(index: i32, job_name: &str) -> String {
    format!("learner-{}-{}", index, job_name)
}

/// The learner StatefulSet and its headless Service.
pub fn learner_set(job_name: &str) -> String {
    format!("learner-{}", job_name)
}

/// The helper Deployment used in split mode.
pub fn helper(job_name: &str) -> String {
    format!("lhelper-{}", job_name)
}

/// The job monitor Deployment.
pub fn job_monitor(job_name: &str) -> String {
    format!("jobmonitor-{}", job_name)
}

/// The parameter server Deployment and Service.
pub fn parameter_server(job_name: &str) -> String {
    format!("grpc-ps-{}", job_name)
}

/// The dynamically provisioned shared volume claim.
pub fn shared_volume_claim(job_name: &str) -> String {
    format!("learner-{}-pvc", job_name)
}

/// The secret holding credentials for mounting the training data bucket.
pub fn data_mount_secret(job_name: &str) -> String {
    format!("cossecretdata-{}", job_name)
}

/// The secret holding credentials for mounting the results bucket.
pub fn results_mount_secret(job_name: &str) -> String {
    format!("cossecretresults-{}", job_name)
}

/// The mounted training data volume.
pub fn data_mount_volume(job_name: &str) -> String {
    format!("cosinputmount-{}", job_name)
}

/// The mounted results volume.
pub fn results_mount_volume(job_name: &str) -> String {
    format!("cosoutputmount-{}", job_name)
}

/// The SSH keypair secret.
pub fn ssh_secret(job_name: &str) -> String {
    format!("jobsshcert-{}", job_name)
}

/// The volume the SSH keypair is mounted from.
pub fn ssh_volume(job_name: &str) -> String {
    format!("sshcertmount-{}", job_name)
}

/// The pull secret for a custom learner image.
pub fn custom_image_secret(job_name: &str) -> String {
    format!("customimage-{}", job_name)
}
