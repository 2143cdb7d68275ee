//! Shell-script stand-in for the recorder, used by lifecycle tests.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::trace::fixtures;
use crate::{Config, RecorderSpec, RecordingSession};

#[derive(Debug, Clone, Copy)]
pub(crate) enum OnInterrupt {
    Exit(i32),
    Ignore,
}

pub(crate) struct FakeRecorder {
    dir: PathBuf,
    script: PathBuf,
}

impl FakeRecorder {
    pub(crate) fn new(on_interrupt: OnInterrupt) -> Self {
        let dir = std::env::temp_dir().join(format!("xctrace-prof-fake-{}", Uuid::new_v4()));
        std::fs::create_dir_all(dir.join("work")).expect("fake recorder dir");
        let trap = match on_interrupt {
            OnInterrupt::Exit(code) => format!("trap 'exit {code}' INT"),
            OnInterrupt::Ignore => "trap '' INT".to_string(),
        };
        let script = dir.join("xctrace.sh");
        std::fs::write(&script, script_body(&trap)).expect("write fake recorder");
        let fake = Self { dir, script };
        fake.set_toc(&fixtures::toc_xml("2026-01-01T00:00:03Z", &["time-profile"]));
        fake.set_table(&fixtures::time_profile_xml(&[(1_000, "work", 0x1000)]));
        fake
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn set_toc(&self, xml: &str) {
        std::fs::write(self.dir.join("toc.xml"), xml).expect("write toc fixture");
    }

    pub(crate) fn set_table(&self, xml: &str) {
        std::fs::write(self.dir.join("table.xml"), xml).expect("write table fixture");
    }

    pub(crate) fn config(&self) -> Config {
        let script = self.script.to_string_lossy().to_string();
        let defaults = RecorderSpec::default();
        let prefixed = |args: &[String]| {
            std::iter::once(script.clone())
                .chain(args.iter().cloned())
                .collect::<Vec<_>>()
        };
        Config {
            recorder: RecorderSpec {
                program: PathBuf::from("/bin/sh"),
                record_args: prefixed(&defaults.record_args),
                export_toc_args: prefixed(&defaults.export_toc_args),
                export_table_args: prefixed(&defaults.export_table_args),
                version_args: prefixed(&defaults.version_args),
            },
            stop_timeout_ms: 5_000,
            export_timeout_ms: 5_000,
            work_dir: Some(self.dir.join("work")),
            ..Config::default()
        }
    }

    /// Blocks until the script has installed its trap and created the trace bundle.
    pub(crate) fn wait_until_recording(&self, session: &RecordingSession) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !session.trace_path().is_dir() {
            assert!(Instant::now() < deadline, "fake recorder never started");
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Drop for FakeRecorder {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

fn script_body(trap: &str) -> String {
    format!(
        r#"here="$(dirname "$0")"
cmd="$1"
shift
out=""
toc=0
while [ $# -gt 0 ]; do
  case "$1" in
    --output) out="$2"; shift 2 ;;
    --toc) toc=1; shift ;;
    *) shift ;;
  esac
done
case "$cmd" in
  version)
    echo "xctrace version 15.0 (fake)"
    ;;
  record)
    {trap}
    mkdir -p "$out"
    while :; do sleep 0.05; done
    ;;
  export)
    if [ "$toc" = 1 ]; then cat "$here/toc.xml" > "$out"; else cat "$here/table.xml" > "$out"; fi
    ;;
  *)
    echo "unknown command $cmd" >&2
    exit 2
    ;;
esac
"#
    )
}
