// End-to-end runs on the host device, through the library and the binary

use std::path::PathBuf;
use std::process::Command;

use vk_integrate::backend::host::SPIRV_MAGIC;
use vk_integrate::backend::HostDevice;
use vk_integrate::integrand::grid_kernel;
use vk_integrate::{integrate, Config, Integrand};

const UNIT_SQUARE: &str = "\
init_steps_x=4
init_steps_y=4
x_start=0
x_end=1
y_start=0
y_end=1
abs_err=0.0000001
rel_err=0.0000001
max_iter=8
";

fn write_config(name: &str, text: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "vk-integrate-{}-{}.cfg",
        name,
        std::process::id()
    ));
    std::fs::write(&path, text).unwrap();
    path
}

fn run_binary(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_vk-integrate"))
        .args(args)
        .output()
        .unwrap()
}

#[test]
fn bilinear_integrand_is_exact() {
    let config = Config::from_toml_str(UNIT_SQUARE).unwrap();
    let device = HostDevice::new(grid_kernel(|x, y| x * y));
    let outcome = integrate(&device, &[SPIRV_MAGIC], &config).unwrap();

    assert!((outcome.result - 0.25).abs() < 1e-12);
    assert!(outcome.converged);
    assert_eq!(outcome.iterations, 2);
    assert_eq!(outcome.splits, [16, 16]);
    assert_eq!(device.live_objects(), 0);
}

#[test]
fn quadratic_integrand_converges_with_overlapped_slots() {
    let text = format!(
        "{UNIT_SQUARE}\n[gpu]\ngrid = [4, 8]\nsync_slots = 3\n\
         timeline_semaphores = true\ndispatch = \"async\"\n"
    );
    let config = Config::from_toml_str(&text).unwrap();
    let device = HostDevice::new(grid_kernel(|x, y| x * x + y * y));
    let outcome = integrate(&device, &[SPIRV_MAGIC], &config).unwrap();

    // Midpoint rule error shrinks by 4x per doubling
    assert!((outcome.result - 2.0 / 3.0).abs() < 1e-5);
    assert!(outcome.converged || outcome.iterations == config.max_iter);
    assert_eq!(device.live_objects(), 0);
}

#[test]
fn bad_kernel_header_is_a_gpu_failure() {
    let config = Config::from_toml_str(UNIT_SQUARE).unwrap();
    let device = HostDevice::new(Integrand::Ackley.host_kernel());
    let err = integrate(&device, &[0xdead_beef], &config).unwrap_err();

    assert_eq!(err.exit_status() as u8, 4);
    assert_eq!(device.live_objects(), 0);
}

#[test]
fn binary_prints_four_lines_on_the_host_device() {
    let path = write_config(
        "ok",
        "init_steps_x=8\ninit_steps_y=8\nx_start=0\nx_end=1\ny_start=0\ny_end=1\n\
         abs_err=0.001\nrel_err=0.001\nmax_iter=6\n",
    );
    let output = run_binary(&["3", path.to_str().unwrap(), "--host"]);
    std::fs::remove_file(&path).ok();

    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8(output.stdout).unwrap();
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 4, "{stdout}");
    let result: f64 = lines[0].parse().unwrap();
    let abs_err: f64 = lines[1].parse().unwrap();
    assert!(result.is_finite());
    assert!(abs_err >= 0.0);
    lines[3].parse::<u128>().unwrap();
}

#[test]
fn binary_exit_codes() {
    // Wrong argument count
    assert_eq!(run_binary(&["1"]).status.code(), Some(1));

    // Unknown function
    let good = write_config("codes", UNIT_SQUARE);
    assert_eq!(
        run_binary(&["7", good.to_str().unwrap(), "--host"]).status.code(),
        Some(2)
    );

    // Missing kernel file
    assert_eq!(
        run_binary(&["1", good.to_str().unwrap(), "--shader-dir", "/no/such/dir"])
            .status
            .code(),
        Some(2)
    );
    std::fs::remove_file(&good).ok();

    // Unreadable configuration
    assert_eq!(
        run_binary(&["1", "/no/such/config.cfg", "--host"]).status.code(),
        Some(3)
    );

    // Missing key
    let partial = write_config("partial", &UNIT_SQUARE.replace("max_iter=8\n", ""));
    assert_eq!(
        run_binary(&["1", partial.to_str().unwrap(), "--host"]).status.code(),
        Some(5)
    );
    std::fs::remove_file(&partial).ok();
}

#[test]
fn fatal_errors_reach_stderr_when_logging_to_a_file() {
    let log = std::env::temp_dir().join(format!("vk-integrate-{}.log", std::process::id()));
    let path = write_config(
        "logfile",
        &format!("{UNIT_SQUARE}\n[debug]\nlog_file = {:?}\n", log.to_str().unwrap()),
    );
    let output = run_binary(&["7", path.to_str().unwrap(), "--host"]);
    std::fs::remove_file(&path).ok();
    std::fs::remove_file(&log).ok();

    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(stderr.contains("no integrand numbered 7"), "{stderr}");
}

#[test]
fn lenient_key_value_lines_are_accepted() {
    let path = write_config(
        "lenient",
        "# unit square\ninit_steps_x=4.\ninit_steps_y=4\nx_start=0\nx_end=1.\n\
         y_start=.0\ny_end=1\nabs_err=0.001\nrel_err=0.001\nmax_iter=2\nmax_iter=6\n",
    );
    let output = run_binary(&["1", path.to_str().unwrap(), "--host"]);
    std::fs::remove_file(&path).ok();

    assert_eq!(output.status.code(), Some(0));
}

#[test]
fn unreachable_accuracy_is_reported_when_required() {
    let path = write_config(
        "strict",
        "init_steps_x=2\ninit_steps_y=2\nx_start=0\nx_end=1\ny_start=0\ny_end=1\n\
         abs_err=0\nrel_err=0\nmax_iter=2\n",
    );
    let relaxed = run_binary(&["2", path.to_str().unwrap(), "--host"]);
    let strict = run_binary(&["2", path.to_str().unwrap(), "--host", "--require-accuracy"]);
    std::fs::remove_file(&path).ok();

    assert_eq!(relaxed.status.code(), Some(0));
    assert_eq!(strict.status.code(), Some(6));
}
