// Command runner: turns a parsed request into a sequence of API calls and
// an exit status. The runner is generic over the `Api` trait so the whole
// command layer can be tested against a fake client.

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

use crate::api::{Api, BuildResult};

/// Closed set of command tags. Anything unrecognized folds to `Help`
/// instead of being an error, so the dispatch table has no failure path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    List,
    Run,
    Wait,
    Result,
    Logs,
    Help,
}

impl Command {
    pub fn from_tag(tag: &str) -> Command {
        match tag {
            "list" => Command::List,
            "run" => Command::Run,
            "wait" => Command::Wait,
            "result" => Command::Result,
            "logs" => Command::Logs,
            _ => Command::Help,
        }
    }
}

/// One user request: a command, a target job (empty for job-agnostic
/// commands) and the build parameters. Built once from argv, never mutated.
#[derive(Debug, Clone)]
pub struct Request {
    pub command: Command,
    pub job: String,
    pub params: BTreeMap<String, String>,
}

impl Request {
    /// Parse `<command> [job] [json-parameters]` from an argument iterator.
    /// A missing command means `help`; parameters must be a flat JSON object
    /// with string values.
    pub fn from_args<I: Iterator<Item = String>>(mut args: I) -> Result<Request> {
        let command = Command::from_tag(args.next().as_deref().unwrap_or("help"));
        let job = args.next().unwrap_or_default();
        let params = match args.next() {
            Some(raw) => serde_json::from_str::<BTreeMap<String, String>>(&raw)
                .context("parameters must be a JSON object of string values")?,
            None => BTreeMap::new(),
        };
        Ok(Request {
            command,
            job,
            params,
        })
    }
}

/// Intervals for the blocking wait loop. The settle interval runs once
/// before the first status check so the server can register a fresh
/// trigger; the poll interval separates subsequent checks. There is no
/// timeout: an interrupted process is the only way out of a stuck wait.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub settle: Duration,
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        PollPolicy {
            settle: Duration::from_secs(10),
            interval: Duration::from_secs(5),
        }
    }
}

/// Print the help screen: every command tag with a one-line description.
/// Also the fallback for unrecognized tags.
pub fn print_help() {
    println!("jenq <command> [job] [json-parameters]");
    println!();
    println!("Commands:");
    println!("  list              list all jobs on the server");
    println!("  run <job> [json]  start a build, wait for it, report the result");
    println!("  wait <job>        block until the job is no longer building");
    println!("  result <job>      print the last build result");
    println!("  logs <job>        print the console log of the last build");
    println!("  help              show this message");
    println!();
    println!("Environment: JENQ_URL, JENQ_CONTEXT_ROOT, JENQ_USER, JENQ_TOKEN, JENQ_INSECURE");
}

/// Sequences API calls for one request and computes the process exit
/// status: 0 for success or neutral outcomes, 1 for failures.
pub struct Runner<A: Api> {
    api: A,
    poll: PollPolicy,
}

impl<A: Api> Runner<A> {
    pub fn new(api: A) -> Runner<A> {
        Runner::with_poll(api, PollPolicy::default())
    }

    /// Tests use this to drop the wait intervals to zero.
    pub fn with_poll(api: A, poll: PollPolicy) -> Runner<A> {
        Runner { api, poll }
    }

    pub fn dispatch(&mut self, request: &Request) -> Result<i32> {
        let needs_job = matches!(
            request.command,
            Command::Run | Command::Wait | Command::Result | Command::Logs
        );
        if needs_job && request.job.is_empty() {
            println!("Missing job name (try 'jenq help')");
            return Ok(1);
        }
        match request.command {
            Command::List => self.cmd_list(),
            Command::Run => self.cmd_run(&request.job, &request.params),
            Command::Wait => self.cmd_wait(&request.job),
            Command::Result => self.cmd_result(&request.job),
            Command::Logs => self.cmd_logs(&request.job),
            Command::Help => {
                print_help();
                Ok(0)
            }
        }
    }

    fn cmd_list(&mut self) -> Result<i32> {
        for name in self.api.list_jobs()? {
            println!("{name}");
        }
        Ok(0)
    }

    /// Build-and-wait-and-report. Validates the job against the listing
    /// first, so a typo never triggers anything on the server.
    fn cmd_run(&mut self, job: &str, params: &BTreeMap<String, String>) -> Result<i32> {
        let jobs = self.api.list_jobs()?;
        if !jobs.iter().any(|name| name == job) {
            println!("Job '{job}' not found on the server");
            return Ok(1);
        }
        // A build may already be in flight from someone else; let it drain
        // before triggering ours.
        self.wait_until_idle(job)?;
        self.api.build(job, params)?;
        println!("New Job Started!");
        self.wait_until_idle(job)?;
        let status = match self.api.get_result(job)? {
            Some(BuildResult::Success) => {
                println!("Result: {}", BuildResult::Success);
                0
            }
            Some(other) => {
                println!("Result: {other}");
                1
            }
            None => {
                println!("Result: still running");
                1
            }
        };
        if status != 0 {
            print!("{}", self.api.get_logs(job, "lastBuild")?);
        }
        Ok(status)
    }

    fn cmd_wait(&mut self, job: &str) -> Result<i32> {
        self.wait_until_idle(job)?;
        println!("{job} is idle");
        Ok(0)
    }

    fn cmd_result(&mut self, job: &str) -> Result<i32> {
        match self.api.get_result(job)? {
            Some(result) => {
                println!("Result: {result}");
                Ok(if result == BuildResult::Success { 0 } else { 1 })
            }
            None => {
                println!("Build is still running");
                Ok(1)
            }
        }
    }

    fn cmd_logs(&mut self, job: &str) -> Result<i32> {
        print!("{}", self.api.get_logs(job, "lastBuild")?);
        Ok(0)
    }

    /// Shared wait loop: settle, then poll until the job reports it is no
    /// longer building. The loop exits exactly one cycle after the
    /// transition is observed.
    fn wait_until_idle(&mut self, job: &str) -> Result<()> {
        thread::sleep(self.poll.settle);
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(ProgressStyle::with_template("{spinner} {msg}").unwrap());
        spinner.set_message(format!("Waiting for {job}..."));
        while self.api.is_building(job)? {
            spinner.tick();
            thread::sleep(self.poll.interval);
        }
        spinner.finish_and_clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use std::collections::VecDeque;

    /// Scripted stand-in for the HTTP client. `building` answers are
    /// consumed front to back; an exhausted script means "not building".
    struct FakeApi {
        jobs: Vec<String>,
        building: VecDeque<bool>,
        result: Option<BuildResult>,
        logs: String,
        list_calls: usize,
        building_calls: usize,
        build_calls: usize,
        logs_calls: usize,
        built_with: Vec<(String, BTreeMap<String, String>)>,
        logs_fetched_for: Vec<String>,
    }

    impl FakeApi {
        fn new() -> FakeApi {
            FakeApi {
                jobs: vec!["deploy".to_string(), "nightly".to_string()],
                building: VecDeque::new(),
                result: Some(BuildResult::Success),
                logs: "console output\n".to_string(),
                list_calls: 0,
                building_calls: 0,
                build_calls: 0,
                logs_calls: 0,
                built_with: Vec::new(),
                logs_fetched_for: Vec::new(),
            }
        }
    }

    impl Api for FakeApi {
        fn list_jobs(&mut self) -> Result<Vec<String>, ApiError> {
            self.list_calls += 1;
            Ok(self.jobs.clone())
        }
        fn get_result(&mut self, _job: &str) -> Result<Option<BuildResult>, ApiError> {
            Ok(self.result.clone())
        }
        fn is_building(&mut self, _job: &str) -> Result<bool, ApiError> {
            self.building_calls += 1;
            Ok(self.building.pop_front().unwrap_or(false))
        }
        fn get_logs(&mut self, _job: &str, build_id: &str) -> Result<String, ApiError> {
            self.logs_calls += 1;
            self.logs_fetched_for.push(build_id.to_string());
            Ok(self.logs.clone())
        }
        fn build(
            &mut self,
            job: &str,
            params: &BTreeMap<String, String>,
        ) -> Result<(), ApiError> {
            self.build_calls += 1;
            self.built_with.push((job.to_string(), params.clone()));
            Ok(())
        }
    }

    fn instant_poll() -> PollPolicy {
        PollPolicy {
            settle: Duration::ZERO,
            interval: Duration::ZERO,
        }
    }

    fn request(command: Command, job: &str) -> Request {
        Request {
            command,
            job: job.to_string(),
            params: BTreeMap::new(),
        }
    }

    #[test]
    fn from_tag_covers_the_closed_set() {
        assert_eq!(Command::from_tag("list"), Command::List);
        assert_eq!(Command::from_tag("run"), Command::Run);
        assert_eq!(Command::from_tag("wait"), Command::Wait);
        assert_eq!(Command::from_tag("result"), Command::Result);
        assert_eq!(Command::from_tag("logs"), Command::Logs);
        assert_eq!(Command::from_tag("help"), Command::Help);
        assert_eq!(Command::from_tag("frobnicate"), Command::Help);
    }

    #[test]
    fn request_parses_json_parameters() {
        let args = ["run", "deploy", r#"{"env":"prod","tag":"v3"}"#]
            .iter()
            .map(|s| s.to_string());
        let req = Request::from_args(args).unwrap();
        assert_eq!(req.command, Command::Run);
        assert_eq!(req.job, "deploy");
        assert_eq!(req.params.get("env").map(String::as_str), Some("prod"));
        assert_eq!(req.params.get("tag").map(String::as_str), Some("v3"));
    }

    #[test]
    fn request_rejects_malformed_parameters() {
        let args = ["run", "deploy", "{not json"].iter().map(|s| s.to_string());
        assert!(Request::from_args(args).is_err());
    }

    #[test]
    fn request_defaults_to_help() {
        let req = Request::from_args(std::iter::empty()).unwrap();
        assert_eq!(req.command, Command::Help);
        assert!(req.job.is_empty());
        assert!(req.params.is_empty());
    }

    #[test]
    fn run_on_unknown_job_makes_no_build_or_wait_calls() {
        let mut api = FakeApi::new();
        let code = Runner::with_poll(&mut api, instant_poll())
            .dispatch(&request(Command::Run, "no-such-job"))
            .unwrap();
        assert_eq!(code, 1);
        assert_eq!(api.build_calls, 0);
        assert_eq!(api.building_calls, 0);
    }

    #[test]
    fn run_success_end_to_end() {
        let mut api = FakeApi::new();
        api.building = VecDeque::from([false, false]);
        api.result = Some(BuildResult::Success);
        let mut req = request(Command::Run, "deploy");
        req.params.insert("env".to_string(), "prod".to_string());
        let code = Runner::with_poll(&mut api, instant_poll())
            .dispatch(&req)
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(api.build_calls, 1);
        assert_eq!(api.built_with[0].0, "deploy");
        assert_eq!(
            api.built_with[0].1.get("env").map(String::as_str),
            Some("prod")
        );
        // success path never touches the console log
        assert_eq!(api.logs_calls, 0);
    }

    #[test]
    fn run_failure_dumps_last_build_log() {
        let mut api = FakeApi::new();
        api.result = Some(BuildResult::Failure);
        let code = Runner::with_poll(&mut api, instant_poll())
            .dispatch(&request(Command::Run, "deploy"))
            .unwrap();
        assert_eq!(code, 1);
        assert_eq!(api.logs_calls, 1);
        assert_eq!(api.logs_fetched_for, vec!["lastBuild".to_string()]);
    }

    #[test]
    fn run_with_no_result_after_wait_is_a_failure() {
        let mut api = FakeApi::new();
        api.result = None;
        let code = Runner::with_poll(&mut api, instant_poll())
            .dispatch(&request(Command::Run, "deploy"))
            .unwrap();
        assert_eq!(code, 1);
    }

    #[test]
    fn wait_stops_one_cycle_after_transition() {
        let mut api = FakeApi::new();
        api.building = VecDeque::from([true, true, false]);
        let code = Runner::with_poll(&mut api, instant_poll())
            .dispatch(&request(Command::Wait, "deploy"))
            .unwrap();
        assert_eq!(code, 0);
        // two polls observe "building", the third observes the transition
        assert_eq!(api.building_calls, 3);
    }

    #[test]
    fn result_maps_states_to_exit_codes() {
        for (result, expected) in [
            (Some(BuildResult::Success), 0),
            (Some(BuildResult::Failure), 1),
            (Some(BuildResult::Unstable), 1),
            (Some(BuildResult::Aborted), 1),
            (None, 1),
        ] {
            let mut api = FakeApi::new();
            api.result = result;
            let code = Runner::with_poll(&mut api, instant_poll())
                .dispatch(&request(Command::Result, "deploy"))
                .unwrap();
            assert_eq!(code, expected);
        }
    }

    #[test]
    fn logs_command_fetches_last_build() {
        let mut api = FakeApi::new();
        let code = Runner::with_poll(&mut api, instant_poll())
            .dispatch(&request(Command::Logs, "deploy"))
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(api.logs_fetched_for, vec!["lastBuild".to_string()]);
    }

    #[test]
    fn list_queries_the_server_once() {
        let mut api = FakeApi::new();
        let code = Runner::with_poll(&mut api, instant_poll())
            .dispatch(&request(Command::List, ""))
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(api.list_calls, 1);
    }

    #[test]
    fn job_commands_require_a_job_name() {
        for command in [Command::Run, Command::Wait, Command::Result, Command::Logs] {
            let mut api = FakeApi::new();
            let code = Runner::with_poll(&mut api, instant_poll())
                .dispatch(&request(command, ""))
                .unwrap();
            assert_eq!(code, 1);
            assert_eq!(api.list_calls, 0);
            assert_eq!(api.building_calls, 0);
        }
    }
}
