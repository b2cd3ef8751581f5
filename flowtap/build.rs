use std::{
    borrow::Cow,
    env,
    ffi::OsString,
    fs,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread,
};

use anyhow::{Context as _, Result, anyhow};
use aya_build::{Package, Toolchain};
use cargo_metadata::{Artifact, CompilerMessage, Message, Target};

const EBPF_PACKAGE: &str = "flowtap-ebpf";
const EBPF_BINARY: &str = "flowtap";

/// `FLOWTAP_EBPF=require` fails the build when the XDP object cannot be
/// produced, `skip` never tries. The default tries and, on failure, embeds an
/// empty object so the kernel flow table reports a load error at runtime.
#[derive(Clone, Copy, PartialEq, Eq)]
enum EbpfPolicy {
    Auto,
    Require,
    Skip,
}

fn main() -> Result<()> {
    println!("cargo:rerun-if-env-changed=FLOWTAP_EBPF");
    let policy = match env::var("FLOWTAP_EBPF").as_deref() {
        Ok("require") => EbpfPolicy::Require,
        Ok("skip") => EbpfPolicy::Skip,
        Ok("auto") | Err(_) => EbpfPolicy::Auto,
        Ok(other) => return Err(anyhow!("FLOWTAP_EBPF={other}: expected auto, require or skip")),
    };

    let out_dir = PathBuf::from(env::var_os("OUT_DIR").ok_or(anyhow!("OUT_DIR not set"))?);
    if policy == EbpfPolicy::Skip {
        return write_placeholder(&out_dir);
    }

    match build_ebpf(&out_dir) {
        Ok(()) => Ok(()),
        Err(err) if policy == EbpfPolicy::Auto => {
            println!("cargo:warning=XDP flow tracker not built ({err:#}); kernel flow table disabled");
            write_placeholder(&out_dir)
        }
        Err(err) => Err(err),
    }
}

fn write_placeholder(out_dir: &Path) -> Result<()> {
    let dst = out_dir.join(EBPF_BINARY);
    fs::write(&dst, b"").with_context(|| format!("failed to write {dst:?}"))
}

fn build_ebpf(out_dir: &Path) -> Result<()> {
    let cargo_metadata::Metadata { packages, .. } = cargo_metadata::MetadataCommand::new()
        .no_deps()
        .exec()
        .context("MetadataCommand::exec")?;
    let cargo_metadata::Package {
        name,
        manifest_path,
        ..
    } = packages
        .into_iter()
        .find(|cargo_metadata::Package { name, .. }| name.as_str() == EBPF_PACKAGE)
        .ok_or_else(|| anyhow!("{EBPF_PACKAGE} package not found"))?;
    let package = Package {
        name: name.as_str(),
        root_dir: manifest_path
            .parent()
            .ok_or_else(|| anyhow!("no parent for {manifest_path}"))?
            .as_str(),
        ..Default::default()
    };
    build_package(out_dir, package, Toolchain::default())
}

fn bpf_target() -> Result<(String, String)> {
    let endian =
        env::var_os("CARGO_CFG_TARGET_ENDIAN").ok_or(anyhow!("CARGO_CFG_TARGET_ENDIAN not set"))?;
    let target = match endian.to_string_lossy().as_ref() {
        "big" => "bpfeb",
        "little" => "bpfel",
        other => return Err(anyhow!("unsupported endian={other}")),
    };
    let arch = env::var("CARGO_CFG_TARGET_ARCH").context("CARGO_CFG_TARGET_ARCH not set")?;
    let arch = if arch.starts_with("riscv64") {
        "riscv64".to_string()
    } else {
        arch
    };
    Ok((format!("{target}-unknown-none"), arch))
}

// Like aya_build::build_ebpf, but compiler output is forwarded with an
// `[ebpf]` prefix instead of flooding the host build log.
fn build_package(out_dir: &Path, package: Package<'_>, toolchain: Toolchain<'_>) -> Result<()> {
    let (target, bpf_target_arch) = bpf_target()?;
    let toolchain_name: Cow<'_, str> = match toolchain {
        Toolchain::Nightly => Cow::Borrowed("nightly"),
        Toolchain::Custom(spec) => Cow::Borrowed(spec),
    };
    let Package {
        name,
        root_dir,
        no_default_features,
        features,
    } = package;
    println!("cargo:rerun-if-changed={root_dir}");
    println!("cargo:rerun-if-changed={root_dir}/../flowtap-common/src");

    let mut cmd = Command::new("rustup");
    cmd.args([
        "run",
        toolchain_name.as_ref(),
        "cargo",
        "build",
        "--package",
        name,
        "-Z",
        "build-std=core",
        "--bins",
        "--message-format=json",
        "--release",
        "--target",
        &target,
    ]);
    if no_default_features {
        cmd.arg("--no-default-features");
    }
    if !features.is_empty() {
        cmd.args(["--features", &features.join(",")]);
    }

    const SEPARATOR: &str = "\x1f";
    let mut rustflags = OsString::new();
    for part in [
        "--cfg=bpf_target_arch=\"",
        &bpf_target_arch,
        "\"",
        SEPARATOR,
        "-Cdebuginfo=2",
        SEPARATOR,
        "-Clink-arg=--btf",
    ] {
        rustflags.push(part);
    }
    cmd.env("CARGO_ENCODED_RUSTFLAGS", rustflags);
    for key in ["RUSTC", "RUSTC_WORKSPACE_WRAPPER"] {
        cmd.env_remove(key);
    }
    cmd.arg("--target-dir").arg(out_dir.join(name));

    let mut child = cmd
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn {cmd:?}"))?;

    let stderr = child.stderr.take().ok_or(anyhow!("child stderr not captured"))?;
    let stderr_handle = thread::spawn(move || {
        for line in BufReader::new(stderr).lines() {
            match line {
                Ok(line) => eprintln!("[ebpf] {line}"),
                Err(err) => eprintln!("[ebpf] failed to read stderr: {err}"),
            }
        }
    });

    let stdout = child.stdout.take().ok_or(anyhow!("child stdout not captured"))?;
    let mut executables = Vec::new();
    for message in Message::parse_stream(BufReader::new(stdout)) {
        match message.context("invalid cargo JSON message")? {
            Message::CompilerArtifact(Artifact {
                executable: Some(executable),
                target: Target { name, .. },
                ..
            }) => executables.push((name, executable.into_std_path_buf())),
            Message::CompilerMessage(CompilerMessage { message, .. }) => {
                for line in message.rendered.iter().flat_map(|r| r.lines()) {
                    eprintln!("[ebpf] {line}");
                }
            }
            Message::TextLine(line) => eprintln!("[ebpf] {line}"),
            _ => {}
        }
    }

    let status = child
        .wait()
        .with_context(|| format!("failed to wait for {cmd:?}"))?;
    if stderr_handle.join().is_err() {
        return Err(anyhow!("stderr forwarder panicked"));
    }
    if !status.success() {
        return Err(anyhow!("{cmd:?} failed: {status:?}"));
    }

    for (name, binary) in executables {
        let dst = out_dir.join(name);
        fs::copy(&binary, &dst).with_context(|| format!("failed to copy {binary:?} to {dst:?}"))?;
    }
    if !out_dir.join(EBPF_BINARY).exists() {
        return Err(anyhow!("{EBPF_PACKAGE} produced no `{EBPF_BINARY}` binary"));
    }
    Ok(())
}
