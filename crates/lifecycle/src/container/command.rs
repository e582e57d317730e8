//! The start/exit rendezvous containers of one job use to sequence their work.
//!
//! Containers of a job share a directory and nothing else. Each wrapped container owns two
//! control files in it, `<name>.start` and `<name>.exit`. Someone else (usually the controller)
//! creates the start file; the container runs its payload once the start file appears and then
//! records the payload's exit code in the exit file. A container that finds its exit file
//! already present never runs again, which keeps restarted containers from repeating work.

/// When a finished payload records its exit code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitPolicy {
    /// Always, overwriting an existing exit file
    Always,
    /// Only if no exit file has been written in the meantime
    IfAbsent,
}

/// A payload wrapped in the control file protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlScript {
    name: String,
    dir: String,
    payload: String,
    exit_policy: ExitPolicy,
}

impl ControlScript {
    /// Wraps `payload` for the container `name` using control files in `dir`.
    pub fn new(name: &str, dir: &str, payload: impl Into<String>) -> Self {
        ControlScript {
            name: name.to_string(),
            dir: dir.to_string(),
            payload: payload.into(),
            exit_policy: ExitPolicy::Always,
        }
    }

    /// Sets when the exit code is recorded.
    pub fn exit_policy(mut self, policy: ExitPolicy) -> Self {
        self.exit_policy = policy;
        self
    }

    /// The path of the start signal.
    fn start_file(&self) -> String {
        format!("{}/{}.start", self.dir, self.name)
    }

    /// The path the exit code is recorded in.
    fn exit_file(&self) -> String {
        format!("{}/{}.exit", self.dir, self.name)
    }

    /// The path the start time is recorded in.
    fn start_time_file(&self) -> String {
        format!("{}/{}.start_time", self.dir, self.name)
    }

    /// The shell script implementing the protocol.
    pub fn render(&self) -> String {
        let exit = self.exit_file();
        let mut lines = vec![
            format!("if [ -f {} ]; then", exit),
            "  while true; do sleep 1000; done".to_string(),
            "fi".to_string(),
            format!("while [ ! -f {} ]; do sleep 2; done", self.start_file()),
            format!("date \"+%s\" > {}", self.start_time_file()),
            self.payload.clone(),
        ];
        match self.exit_policy {
            ExitPolicy::Always => lines.push(format!("echo $? > {}", exit)),
            ExitPolicy::IfAbsent => {
                lines.push("rc=$?".to_string());
                lines.push(format!("if [ ! -f {} ]; then echo $rc > {}; fi", exit, exit));
            }
        }
        lines.push("while true; do sleep 2; done".to_string());
        lines.join("\n")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::BTreeMap;

    /// The state of one container's control files.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum ControlFileState {
        /// Neither file exists; the container waits
        Absent,
        /// The start file exists and the exit file does not; the payload may run
        StartSignaled,
        /// The exit file exists; the payload has run
        ExitRecorded,
    }

    /// Read and write access to the shared control directory, standing in for the shell.
    trait ControlFiles {
        /// Whether a file exists.
        fn exists(&self, path: &str) -> bool;
        /// Creates or overwrites a file.
        fn write(&mut self, path: &str, contents: &str);
    }

    /// What one pass of the protocol did.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Step {
        /// The start signal has not arrived yet
        Waiting,
        /// The payload ran and exited with the given code
        Ran(i32),
        /// The payload already ran; the container only idles
        Idle,
    }

    impl ControlScript {
        /// The current state of this container's control files.
        fn state(&self, files: &dyn ControlFiles) -> ControlFileState {
            if files.exists(&self.exit_file()) {
                ControlFileState::ExitRecorded
            } else if files.exists(&self.start_file()) {
                ControlFileState::StartSignaled
            } else {
                ControlFileState::Absent
            }
        }

        /// Runs one pass of the protocol against `files`, the way `render` does.
        /// `payload` is only invoked once the start signal is present and no exit code has been
        /// recorded.
        fn step<F>(&self, files: &mut dyn ControlFiles, now: &str, payload: F) -> Step
        where
            F: FnOnce(&mut dyn ControlFiles) -> i32,
        {
            match self.state(files) {
                ControlFileState::ExitRecorded => Step::Idle,
                ControlFileState::Absent => Step::Waiting,
                ControlFileState::StartSignaled => {
                    files.write(&self.start_time_file(), now);
                    let code = payload(files);
                    let record = match self.exit_policy {
                        ExitPolicy::Always => true,
                        ExitPolicy::IfAbsent => !files.exists(&self.exit_file()),
                    };
                    if record {
                        files.write(&self.exit_file(), &code.to_string());
                    }
                    Step::Ran(code)
                }
            }
        }
    }

    #[derive(Default)]
    struct FakeFiles(BTreeMap<String, String>);

    impl ControlFiles for FakeFiles {
        fn exists(&self, path: &str) -> bool {
            self.0.contains_key(path)
        }

        fn write(&mut self, path: &str, contents: &str) {
            self.0.insert(path.to_string(), contents.to_string());
        }
    }

    #[test]
    fn waits_for_the_start_signal() {
        let script = ControlScript::new("load-data", "/job", "load.sh");
        let mut files = FakeFiles::default();
        let mut ran = false;
        let step = script.step(&mut files, "0", |_| {
            ran = true;
            0
        });
        assert_eq!(step, Step::Waiting);
        assert!(!ran);
        assert_eq!(script.state(&files), ControlFileState::Absent);
    }

    #[test]
    fn runs_once_and_records_the_exit_code() {
        let script = ControlScript::new("load-data", "/job", "load.sh");
        let mut files = FakeFiles::default();
        files.write("/job/load-data.start", "");
        assert_eq!(script.state(&files), ControlFileState::StartSignaled);

        let mut runs = 0;
        assert_eq!(
            script.step(&mut files, "1700000000", |_| {
                runs += 1;
                3
            }),
            Step::Ran(3)
        );
        assert_eq!(files.0["/job/load-data.exit"], "3");
        assert_eq!(files.0["/job/load-data.start_time"], "1700000000");
        assert_eq!(script.state(&files), ControlFileState::ExitRecorded);

        assert_eq!(
            script.step(&mut files, "1700000100", |_| {
                runs += 1;
                0
            }),
            Step::Idle
        );
        assert_eq!(runs, 1);
    }

    #[test]
    fn existing_exit_file_never_reexecutes() {
        let script = ControlScript::new("learner", "/job", "train.sh");
        let mut files = FakeFiles::default();
        files.write("/job/learner.start", "");
        files.write("/job/learner.exit", "0");
        let step = script.step(&mut files, "0", |_| panic!("payload must not run"));
        assert_eq!(step, Step::Idle);
    }

    #[test]
    fn if_absent_keeps_an_exit_code_written_during_the_run() {
        let script =
            ControlScript::new("learner", "/job", "train.sh").exit_policy(ExitPolicy::IfAbsent);
        let mut files = FakeFiles::default();
        files.write("/job/learner.start", "");
        let step = script.step(&mut files, "0", |f| {
            f.write("/job/learner.exit", "137");
            1
        });
        assert_eq!(step, Step::Ran(1));
        assert_eq!(files.0["/job/learner.exit"], "137");
    }

    #[test]
    fn rendered_script_guards_then_waits_then_records() {
        let rendered = ControlScript::new("store-results", "/job", "store.sh").render();
        let guard = rendered.find("if [ -f /job/store-results.exit ]").unwrap();
        let wait = rendered
            .find("while [ ! -f /job/store-results.start ]; do sleep 2; done")
            .unwrap();
        let started = rendered
            .find("date \"+%s\" > /job/store-results.start_time")
            .unwrap();
        let payload = rendered.find("store.sh").unwrap();
        let record = rendered.find("echo $? > /job/store-results.exit").unwrap();
        assert!(guard < wait && wait < started && started < payload && payload < record);
        assert!(rendered.ends_with("while true; do sleep 2; done"));

        let learner = ControlScript::new("learner", "/job", "train.sh")
            .exit_policy(ExitPolicy::IfAbsent)
            .render();
        assert!(learner.contains("if [ ! -f /job/learner.exit ]; then echo $rc > /job/learner.exit; fi"));
    }
}
