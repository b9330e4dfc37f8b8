use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use chrono::Utc;
use piperun::lockfile::StepLock;
use piperun::manifest::read_status;
use piperun::{PipelineError, PipelineManager, RunConfig, RunStatus, Step, StepOutcome};
use tempfile::tempdir;

fn manager(dir: &Path, config: RunConfig) -> PipelineManager {
    PipelineManager::new("basic", dir, config).unwrap()
}

fn executions(counter: &Path) -> usize {
    fs::read_to_string(counter)
        .map(|content| content.lines().count())
        .unwrap_or(0)
}

fn dead_pid() -> u32 {
    let mut child = Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

#[test]
fn target_step_runs_once_then_skips() {
    let temp = tempdir().unwrap();
    let out = temp.path().join("out.txt");
    let mut pipeline = manager(temp.path(), RunConfig::embedded());

    let command = format!("echo hi > {}", out.display());
    let first = pipeline.run_command(&command, Some(&out), Some(true)).unwrap();
    assert!(!first.is_skipped());
    assert_eq!(first.exit_code, 0);
    assert_eq!(fs::read_to_string(&out).unwrap(), "hi\n");
    assert!(pipeline.checkpoints().is_done("out.txt"));
    assert!(!pipeline.locks().is_locked("out.txt"));

    let second = pipeline.run_command(&command, Some(&out), Some(true)).unwrap();
    assert!(second.is_skipped());
    assert_eq!(second.elapsed, Duration::ZERO);

    pipeline.stop_pipeline().unwrap();
    assert_eq!(read_status(temp.path(), "basic"), Some(RunStatus::Completed));
}

#[test]
fn capture_always_executes_and_is_never_checkpointed() {
    let temp = tempdir().unwrap();
    let counter = temp.path().join("calls");
    let mut pipeline = manager(temp.path(), RunConfig::embedded());

    let command = format!("echo call >> {} && echo 42", counter.display());
    assert_eq!(pipeline.check_and_capture(&command, Some(true)).unwrap(), "42");
    assert_eq!(pipeline.check_and_capture(&command, Some(true)).unwrap(), "42");
    assert_eq!(executions(&counter), 2);
    assert!(pipeline.checkpoints().list().unwrap().is_empty());
    pipeline.stop_pipeline().unwrap();
}

#[test]
fn rerunning_in_a_new_process_performs_no_executions() {
    let temp = tempdir().unwrap();
    let counter = temp.path().join("calls");
    let out = temp.path().join("sorted.txt");
    let step = Step::new(format!(
        "echo call >> {} && echo b a | tr ' ' '\\n' | sort > {}",
        counter.display(),
        out.display()
    ))
    .target(&out);

    for _ in 0..2 {
        let mut pipeline = manager(temp.path(), RunConfig::embedded());
        pipeline.run(&step).unwrap();
        pipeline.stop_pipeline().unwrap();
    }
    assert_eq!(executions(&counter), 1);
    assert_eq!(fs::read_to_string(&out).unwrap(), "a\nb\n");
}

#[test]
fn failing_command_stops_the_group() {
    let temp = tempdir().unwrap();
    let marker = temp.path().join("second_ran");
    let target = temp.path().join("final.txt");
    let step = Step::group([
        "false".to_string(),
        format!("touch {}", marker.display()),
        format!("touch {}", target.display()),
    ])
    .target(&target)
    .label("group");

    let mut pipeline = manager(temp.path(), RunConfig::embedded());
    let err = pipeline.run(&step).unwrap_err();
    match err {
        PipelineError::StepExecution { label, index, code, .. } => {
            assert_eq!(label, "group");
            assert_eq!(index, 0);
            assert_eq!(code, 1);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!marker.exists());
    assert!(!target.exists());
    assert!(pipeline.locks().is_locked("group"));
    assert_eq!(pipeline.status(), RunStatus::Failed);
}

#[test]
fn leftover_lock_from_dead_owner_discards_partial_target_and_reruns() {
    let temp = tempdir().unwrap();
    let target = temp.path().join("aligned.bam");
    fs::write(&target, "partial").unwrap();

    let pipeline_dir = temp.path();
    let lock = StepLock {
        run: "basic".into(),
        label: "aligned.bam".into(),
        pid: dead_pid(),
        started_at: Utc::now(),
        commands: vec!["align".into()],
    };
    fs::write(
        pipeline_dir.join("lock.aligned.bam"),
        serde_yaml::to_string(&lock).unwrap(),
    )
    .unwrap();

    let mut pipeline = manager(pipeline_dir, RunConfig::embedded());
    let result = pipeline
        .run(&Step::new(format!("echo complete > {}", target.display())).target(&target))
        .unwrap();
    assert_eq!(result.outcome, StepOutcome::Recovered);
    assert_eq!(fs::read_to_string(&target).unwrap(), "complete\n");
    assert!(!pipeline.locks().is_locked("aligned.bam"));
    pipeline.stop_pipeline().unwrap();
}

#[test]
fn lock_held_by_live_process_is_an_error() {
    let temp = tempdir().unwrap();
    let target = temp.path().join("index.idx");
    let mut holder = Command::new("sleep").arg("30").spawn().unwrap();
    let lock = StepLock {
        run: "other".into(),
        label: "index.idx".into(),
        pid: holder.id(),
        started_at: Utc::now(),
        commands: Vec::new(),
    };
    fs::write(
        temp.path().join("lock.index.idx"),
        serde_yaml::to_string(&lock).unwrap(),
    )
    .unwrap();

    let mut pipeline = manager(temp.path(), RunConfig::embedded());
    let err = pipeline
        .run(&Step::new(format!("touch {}", target.display())).target(&target))
        .unwrap_err();
    assert!(matches!(err, PipelineError::LockHeld { .. }));
    assert!(!target.exists());

    holder.kill().unwrap();
    holder.wait().unwrap();
}

#[test]
fn missing_target_after_success_is_an_error() {
    let temp = tempdir().unwrap();
    let target = temp.path().join("never.txt");
    let mut pipeline = manager(temp.path(), RunConfig::embedded());
    let err = pipeline.run(&Step::new("true").target(&target)).unwrap_err();
    assert!(matches!(err, PipelineError::MissingTarget { .. }));
    assert!(!pipeline.checkpoints().is_done("never.txt"));
}

#[test]
fn nofail_step_reports_code_and_continues() {
    let temp = tempdir().unwrap();
    let target = temp.path().join("after.txt");
    let mut pipeline = manager(temp.path(), RunConfig::embedded());

    let result = pipeline.run(&Step::new("exit 3").shell(true).nofail()).unwrap();
    assert_eq!(result.exit_code, 3);
    assert!(!result.success());

    pipeline
        .run(&Step::new(format!("touch {}", target.display())).target(&target))
        .unwrap();
    assert!(target.exists());
    pipeline.stop_pipeline().unwrap();
}

#[test]
fn checkpointed_step_without_targets_runs_once() {
    let temp = tempdir().unwrap();
    let counter = temp.path().join("calls");
    let step = Step::new(format!("echo call >> {}", counter.display()))
        .label("setup")
        .checkpointed();

    let mut pipeline = manager(temp.path(), RunConfig::embedded());
    assert!(!pipeline.run(&step).unwrap().is_skipped());
    assert!(pipeline.run(&step).unwrap().is_skipped());
    assert_eq!(executions(&counter), 1);
    pipeline.stop_pipeline().unwrap();
}

#[test]
fn new_start_reruns_completed_steps() {
    let temp = tempdir().unwrap();
    let counter = temp.path().join("calls");
    let out = temp.path().join("out.txt");
    let step = Step::new(format!(
        "echo call >> {} && touch {}",
        counter.display(),
        out.display()
    ))
    .target(&out);

    let mut pipeline = manager(temp.path(), RunConfig::embedded());
    pipeline.run(&step).unwrap();
    pipeline.stop_pipeline().unwrap();

    let config = RunConfig {
        new_start: true,
        ..RunConfig::embedded()
    };
    let mut pipeline = manager(temp.path(), config);
    assert!(!pipeline.run(&step).unwrap().is_skipped());
    pipeline.stop_pipeline().unwrap();
    assert_eq!(executions(&counter), 2);
}

#[test]
fn stop_after_pauses_the_run() {
    let temp = tempdir().unwrap();
    let first = temp.path().join("first.txt");
    let config = RunConfig {
        stop_after: Some("first.txt".into()),
        ..RunConfig::embedded()
    };
    let mut pipeline = manager(temp.path(), config);
    let err = pipeline
        .run(&Step::new(format!("touch {}", first.display())).target(&first))
        .unwrap_err();
    assert!(matches!(err, PipelineError::Halted(ref label) if label == "first.txt"));
    assert_eq!(err.exit_code(), 0);
    assert_eq!(pipeline.status(), RunStatus::Paused);
    assert!(pipeline.checkpoints().is_done("first.txt"));
    drop(pipeline);
    assert_eq!(read_status(temp.path(), "basic"), Some(RunStatus::Paused));
}

#[test]
fn timeout_kills_the_command() {
    let temp = tempdir().unwrap();
    let config = RunConfig {
        step_timeout_secs: Some(1),
        ..RunConfig::embedded()
    };
    let mut pipeline = manager(temp.path(), config);
    let err = pipeline.run(&Step::new("sleep 30").label("slow")).unwrap_err();
    assert!(matches!(err, PipelineError::Timeout { .. }));
    assert_eq!(err.exit_code(), 124);
}

#[test]
fn cleanup_removes_registered_files_on_stop() {
    let temp = tempdir().unwrap();
    let scratch = temp.path().join("scratch.tmp");
    let keep = temp.path().join("keep.txt");
    fs::write(&scratch, "x").unwrap();
    fs::write(&keep, "x").unwrap();

    let mut pipeline = manager(temp.path(), RunConfig::embedded());
    pipeline
        .clean_add(format!("{}/*.tmp", temp.path().display()))
        .unwrap();
    pipeline.stop_pipeline().unwrap();
    assert!(!scratch.exists());
    assert!(keep.exists());
}

#[test]
fn dirty_mode_writes_cleanup_script_instead() {
    let temp = tempdir().unwrap();
    let scratch = temp.path().join("scratch.tmp");
    fs::write(&scratch, "x").unwrap();

    let config = RunConfig {
        dirty: true,
        ..RunConfig::embedded()
    };
    let mut pipeline = manager(temp.path(), config);
    pipeline
        .clean_add(format!("{}/*.tmp", temp.path().display()))
        .unwrap();
    pipeline.stop_pipeline().unwrap();

    assert!(scratch.exists());
    let script = fs::read_to_string(temp.path().join("basic_cleanup.sh")).unwrap();
    assert!(script.contains("rm -rf"));
    assert!(script.contains("*'.tmp'"));
}

#[test]
fn stats_are_readable_across_runs() {
    let temp = tempdir().unwrap();
    {
        let mut pipeline = manager(temp.path(), RunConfig::embedded());
        pipeline.report_result("reads", 1200).unwrap();
        pipeline.stop_pipeline().unwrap();
    }
    let mut pipeline = manager(temp.path(), RunConfig::embedded());
    assert_eq!(pipeline.get_stat("reads").as_deref(), Some("1200"));
    assert!(pipeline.get_stat("Time").is_some());
    assert!(pipeline.get_stat("Peak_memory_GB").is_some());
    pipeline.stop_pipeline().unwrap();
}

#[test]
fn commands_and_profile_are_journaled() {
    let temp = tempdir().unwrap();
    let out = temp.path().join("out.txt");
    let mut pipeline = manager(temp.path(), RunConfig::embedded());
    pipeline
        .run(&Step::new(format!("touch {}", out.display())).target(&out))
        .unwrap();
    pipeline.stop_pipeline().unwrap();

    let commands = fs::read_to_string(temp.path().join("basic_commands.sh")).unwrap();
    assert!(commands.contains("# out.txt"));
    assert!(commands.contains("touch "));
    let profile = fs::read_to_string(temp.path().join("basic_profile.tsv")).unwrap();
    assert_eq!(profile.lines().count(), 2);
}

#[test]
fn dropping_an_unstopped_manager_marks_failure() {
    let temp = tempdir().unwrap();
    {
        let _pipeline = manager(temp.path(), RunConfig::embedded());
        assert_eq!(read_status(temp.path(), "basic"), Some(RunStatus::Running));
    }
    assert_eq!(read_status(temp.path(), "basic"), Some(RunStatus::Failed));
}

#[test]
fn metrics_count_executions_and_skips() {
    let temp = tempdir().unwrap();
    let out = temp.path().join("out.txt");
    let step = Step::new(format!("touch {}", out.display())).target(&out);
    let mut pipeline = manager(temp.path(), RunConfig::embedded());
    pipeline.run(&step).unwrap();
    pipeline.run(&step).unwrap();
    let snapshot = pipeline.stop_pipeline().unwrap();

    assert_eq!(snapshot.executed, 1);
    assert_eq!(snapshot.skipped, 1);
    let step_metrics = snapshot.steps.get("out.txt").unwrap();
    assert_eq!(step_metrics.calls, 2);
    assert_eq!(step_metrics.executions, 1);
    assert_eq!(step_metrics.skips, 1);
}

#[test]
fn failed_nofail_step_does_not_leave_a_trusted_target() {
    let temp = tempdir().unwrap();
    let target = temp.path().join("t.txt");
    let step = Step::group([
        format!("sh -c 'echo partial > {}'", target.display()),
        "false".to_string(),
    ])
    .target(&target)
    .nofail();

    let mut pipeline = manager(temp.path(), RunConfig::embedded());
    let first = pipeline.run(&step).unwrap();
    assert_eq!(first.exit_code, 1);
    assert!(!target.exists());
    assert!(!pipeline.checkpoints().is_done("t.txt"));

    let second = pipeline.run(&step).unwrap();
    assert!(!second.is_skipped());
    assert_eq!(second.exit_code, 1);
    pipeline.stop_pipeline().unwrap();
}

#[test]
fn time_limit_covers_the_whole_step() {
    let temp = tempdir().unwrap();
    let config = RunConfig {
        step_timeout_secs: Some(1),
        ..RunConfig::embedded()
    };
    let mut pipeline = manager(temp.path(), config);
    let err = pipeline
        .run(&Step::group(["sleep 0.7", "sleep 0.7", "sleep 0.7"]).label("slow-group"))
        .unwrap_err();
    match err {
        PipelineError::Timeout { label, command, .. } => {
            assert_eq!(label, "slow-group");
            assert_eq!(command, "sleep 0.7");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn targets_sharing_a_file_name_keep_separate_state() {
    let temp = tempdir().unwrap();
    let a = temp.path().join("a");
    let b = temp.path().join("b");
    fs::create_dir_all(&a).unwrap();
    fs::create_dir_all(&b).unwrap();
    let first = a.join("out.txt");
    let second = b.join("out.txt");

    let mut pipeline = manager(temp.path(), RunConfig::embedded());
    let one = pipeline
        .run(&Step::new(format!("touch {}", first.display())).target(&first))
        .unwrap();
    let two = pipeline
        .run(&Step::new(format!("touch {}", second.display())).target(&second))
        .unwrap();

    assert_eq!(one.label, "a/out.txt");
    assert_eq!(two.label, "b/out.txt");
    assert!(!two.is_skipped());
    assert_eq!(
        pipeline.checkpoints().list().unwrap(),
        vec!["a/out.txt".to_string(), "b/out.txt".to_string()]
    );
    pipeline.stop_pipeline().unwrap();
}

#[test]
fn new_start_leaves_other_runs_checkpoints_alone() {
    let temp = tempdir().unwrap();
    let out = temp.path().join("x.txt");
    let step = Step::new(format!("touch {}", out.display())).target(&out);

    let mut other = PipelineManager::new("basic_two", temp.path(), RunConfig::embedded()).unwrap();
    other.run(&step).unwrap();
    other.stop_pipeline().unwrap();

    let config = RunConfig {
        new_start: true,
        ..RunConfig::embedded()
    };
    let mut pipeline = manager(temp.path(), config);
    assert!(pipeline.checkpoints().list().unwrap().is_empty());
    pipeline.stop_pipeline().unwrap();

    let other = PipelineManager::new("basic_two", temp.path(), RunConfig::embedded()).unwrap();
    assert!(other.checkpoints().is_done("x.txt"));
}

#[test]
fn invalid_run_names_are_rejected() {
    let temp = tempdir().unwrap();
    let err = PipelineManager::new("bad name", temp.path(), RunConfig::embedded())
        .err()
        .unwrap();
    assert!(matches!(err, PipelineError::InvalidRunName { .. }));
}

#[test]
fn capture_keeps_non_utf8_output() {
    let temp = tempdir().unwrap();
    let mut pipeline = manager(temp.path(), RunConfig::embedded());
    let value = pipeline
        .check_and_capture("printf 'ab\\377cd'", Some(true))
        .unwrap();
    assert_eq!(value, "ab\u{FFFD}cd");
    pipeline.stop_pipeline().unwrap();
}
