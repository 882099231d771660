/// Process hardening applied at daemon startup.
///
/// Passphrases for lock/unlock and smartcard PINs pass through this
/// process, so it must never leave a core file behind.  Everything here is
/// best-effort: failures are logged and the daemon carries on.
///
/// 1. **`RLIMIT_CORE = 0`**: no core file is written on crash.
/// 2. **`PR_SET_DUMPABLE 0`** (Linux): also blocks `/proc/<pid>/mem` reads
///    and ptrace attach by other non-root processes.
#[cfg(unix)]
pub fn secure_bootstrap() {
    disable_core_dumps();
    #[cfg(target_os = "linux")]
    set_not_dumpable();
}

#[cfg(not(unix))]
pub fn secure_bootstrap() {}

#[cfg(unix)]
fn disable_core_dumps() {
    let limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: setrlimit only reads the struct we pass.
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_CORE, &limit) };
    if ret == 0 {
        tracing::debug!("RLIMIT_CORE=0: core dumps disabled");
    } else {
        let err = std::io::Error::last_os_error();
        tracing::warn!("setrlimit(RLIMIT_CORE, 0) failed (non-fatal): {err}");
    }
}

#[cfg(target_os = "linux")]
fn set_not_dumpable() {
    // SAFETY: prctl with PR_SET_DUMPABLE takes plain integer arguments.
    let ret = unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 0i64, 0i64, 0i64, 0i64) };
    if ret == 0 {
        tracing::debug!("PR_SET_DUMPABLE=0: /proc/pid/mem access disabled");
    } else {
        let err = std::io::Error::last_os_error();
        tracing::warn!("PR_SET_DUMPABLE=0 failed (non-fatal): {err}");
    }
}
