//! Test-only helpers: fixture profiles, fake bundles and scripted backends.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use walkdir::WalkDir;

use crate::core::types::{ProvisioningProfile, SignerEvent, SigningRequest};
use crate::error::ToolError;
use crate::io::builder::{BuildRequest, BuildRunner};
use crate::io::process::CancelToken;
use crate::io::profiles::{bundle_id_fragment, parse_profile};
use crate::io::signer::{EventSink, SigningEngine};
use crate::io::xcode::XcodeToolchain;

/// In-memory profile pointing at `/profiles/<uuid>.mobileprovision`.
pub fn profile(uuid: &str, name: &str, team: &str) -> ProvisioningProfile {
    let bundle_id = bundle_id_fragment(name);
    let label = bundle_id.clone().unwrap_or_else(|| name.to_string());
    ProvisioningProfile {
        uuid: uuid.to_string(),
        name: format!("{label} (Team: {team}) ({uuid})"),
        profile_name: name.to_string(),
        team_name: team.to_string(),
        bundle_id,
        file_path: PathBuf::from(format!("/profiles/{uuid}.mobileprovision")),
        expired: false,
    }
}

/// Write a profile file into `dir` and parse it back.
pub fn profile_at(dir: &Path, uuid: &str, name: &str, team: &str) -> ProvisioningProfile {
    let path = write_profile(dir, &format!("{uuid}.mobileprovision"), uuid, name, team);
    parse_profile(&path).expect("parse fixture profile")
}

/// XML property list with the keys a `.mobileprovision` carries.
pub fn profile_plist(uuid: &str, name: &str, team: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
<!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" \"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">\n\
<plist version=\"1.0\">\n\
<dict>\n\
\t<key>AppIDName</key>\n\
\t<string>WebDriverAgent</string>\n\
\t<key>ExpirationDate</key>\n\
\t<date>2099-01-01T00:00:00Z</date>\n\
\t<key>Name</key>\n\
\t<string>{name}</string>\n\
\t<key>TeamName</key>\n\
\t<string>{team}</string>\n\
\t<key>UUID</key>\n\
\t<string>{uuid}</string>\n\
\t<key>Version</key>\n\
\t<integer>1</integer>\n\
</dict>\n\
</plist>\n"
    )
}

/// Write `profile_plist` wrapped in bytes resembling a CMS envelope.
pub fn write_profile(dir: &Path, file: &str, uuid: &str, name: &str, team: &str) -> PathBuf {
    fs::create_dir_all(dir).expect("create profile dir");
    let mut bytes = vec![0x30, 0x82, 0x0f, 0x1a, 0x06, 0x09, 0x2a, 0x86];
    bytes.extend_from_slice(profile_plist(uuid, name, team).as_bytes());
    bytes.extend_from_slice(&[0xa0, 0x82, 0x0b, 0x00, 0x00]);
    let path = dir.join(file);
    fs::write(&path, bytes).expect("write profile");
    path
}

/// Executable `/bin/sh` script standing in for an external tool.
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}")).expect("write script");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod script");
    path
}

/// Minimal `.app` layout as produced by `build-for-testing`.
pub fn write_fake_bundle(dir: &Path, name: &str) -> PathBuf {
    let bundle = dir.join(name);
    let files: [(&str, &[u8]); 5] = [
        ("Info.plist", b"<plist>runner</plist>"),
        ("WebDriverAgentRunner-Runner", b"\xcf\xfa\xed\xfe runner"),
        ("Frameworks/XCTest.framework/XCTest", b"xctest"),
        ("Frameworks/libXCTestSwiftSupport.dylib", b"swift support"),
        ("PlugIns/Runner.xctest/Info.plist", b"<plist>xctest</plist>"),
    ];
    for (rel, contents) in files {
        let path = bundle.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create bundle dir");
        }
        fs::write(&path, contents).expect("write bundle file");
    }
    bundle
}

/// Relative `/`-separated paths under `dir`; `None` marks directories.
pub fn snapshot_tree(dir: &Path) -> BTreeMap<String, Option<Vec<u8>>> {
    WalkDir::new(dir)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .map(|entry| {
            let entry = entry.expect("walk");
            let rel = entry
                .path()
                .strip_prefix(dir)
                .expect("relative")
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            let contents = if entry.file_type().is_dir() {
                None
            } else {
                Some(fs::read(entry.path()).expect("read"))
            };
            (rel, contents)
        })
        .collect()
}

/// Toolchain reporting a fixed major version or failure.
pub struct FixedXcode(pub Result<u32, String>);

impl XcodeToolchain for FixedXcode {
    fn major_version(&self) -> Result<u32, ToolError> {
        self.0.clone().map_err(ToolError::VersionDetection)
    }
}

/// One scripted build outcome.
#[derive(Debug, Clone)]
pub enum ScriptedBuild {
    /// Lay out a fake bundle where `xcodebuild` would.
    Bundle,
    /// Report success without producing a bundle.
    NoBundle,
    Fail(String),
    /// Keep building until the request is cancelled.
    UntilCancelled,
}

/// Build runner that replays outcomes in order; exhausting them is a build error.
pub struct ScriptedBuildRunner {
    script: Mutex<VecDeque<ScriptedBuild>>,
    calls: AtomicUsize,
}

impl ScriptedBuildRunner {
    pub fn new(script: Vec<ScriptedBuild>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl BuildRunner for ScriptedBuildRunner {
    fn run(&self, request: &BuildRequest, cancel: &CancelToken) -> Result<(), ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().expect("lock").pop_front();
        let log = request.log_path();
        fs::create_dir_all(log.parent().expect("log parent")).expect("create log dir");
        fs::write(&log, "scripted build\n").expect("write log");
        match next {
            Some(ScriptedBuild::Bundle) => {
                let bundle = request.bundle_path();
                let name = bundle.file_name().expect("bundle name").to_string_lossy();
                write_fake_bundle(&request.products_dir(), &name);
                Ok(())
            }
            Some(ScriptedBuild::NoBundle) => Ok(()),
            Some(ScriptedBuild::Fail(msg)) => Err(ToolError::Build(msg)),
            Some(ScriptedBuild::UntilCancelled) => {
                while !cancel.is_cancelled() {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(ToolError::Cancelled { stage: "build" })
            }
            None => Err(ToolError::Build("no scripted build left".to_string())),
        }
    }
}

/// One scripted signing outcome.
#[derive(Debug, Clone)]
pub enum ScriptedSign {
    /// Copy the input archive to the output and report `warnings`.
    Succeed { warnings: Vec<String> },
    Fail(String),
}

/// Signing engine that replays outcomes and records every request.
pub struct ScriptedSigner {
    script: Mutex<VecDeque<ScriptedSign>>,
    requests: Mutex<Vec<SigningRequest>>,
}

impl ScriptedSigner {
    pub fn new(script: Vec<ScriptedSign>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<SigningRequest> {
        self.requests.lock().expect("lock").clone()
    }
}

impl SigningEngine for ScriptedSigner {
    fn sign(
        &self,
        request: &SigningRequest,
        events: EventSink<'_>,
        _cancel: &CancelToken,
    ) -> Result<(), ToolError> {
        self.requests.lock().expect("lock").push(request.clone());
        match self.script.lock().expect("lock").pop_front() {
            Some(ScriptedSign::Succeed { warnings }) => {
                events(SignerEvent::Message(format!(
                    "Resigning {}",
                    request.input_archive.display()
                )));
                for warning in warnings {
                    events(SignerEvent::Warning(warning));
                }
                fs::copy(&request.input_archive, &request.output_path)
                    .map_err(|err| ToolError::Signing(err.to_string()))?;
                Ok(())
            }
            Some(ScriptedSign::Fail(msg)) => Err(ToolError::Signing(msg)),
            None => Err(ToolError::Signing("no scripted signing left".to_string())),
        }
    }
}
