use std::path::Path;
use std::thread;
use std::time::Duration;

use crate::stop_signal::StopSignal;

/// Poll for `path` and set `stop` once it exists.
///
/// Returns `true` if this monitor raised the stop, `false` if there was
/// nothing to watch or someone else stopped first. The file is only ever
/// stat'ed: never read, created or removed.
pub fn watch_killfile<S: StopSignal + ?Sized>(stop: &S, path: Option<&Path>, poll: Duration) -> bool {
    let Some(path) = path else {
        return false;
    };

    while !stop.is_set() {
        if path.exists() {
            tracing::info!(killfile = %path.display(), "killfile observed, requesting stop");
            stop.set();
            return true;
        }
        thread::sleep(poll);
    }
    false
}
