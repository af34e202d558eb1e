//! The wrapper table: commands that exist to run other commands.
//!
//! Each entry is data: which flags consume an argument, how many
//! positional operands precede the payload, and how the payload is
//! expressed (an argv tail, a `-c` script string, a `-exec … ;` span).
//! New wrappers extend the table, not the walking code.

/// How a wrapper carries the command it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WrapperMode {
    /// The remaining tokens are the wrapped argv (`sudo CMD ARGS…`).
    Argv,
    /// A `-c` flag carries a shell script string (`bash -c SCRIPT`);
    /// without `-c` the remaining tokens are treated as an argv
    /// (a script file invocation).
    ShellScript,
    /// Every remaining token is concatenated into one script (`eval`,
    /// `watch`, and the remote command of `ssh`).
    Concat,
    /// The payload spans from an exec-style flag to a `;` or `+`
    /// terminator (`find -exec`, `fd -x`).
    ExecSpan,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Wrapper {
    pub name: &'static str,
    /// Flags that consume the following token as their argument.
    pub flags_with_arg: &'static [&'static str],
    /// Positional operands to skip before the payload starts (the ssh
    /// destination, the flock lock file, the timeout duration).
    pub skip_positionals: usize,
    /// Whether leading `VAR=value` operands are part of the wrapper
    /// (`env`, `sudo`) rather than the payload.
    pub skips_env_assignments: bool,
    pub mode: WrapperMode,
}

const fn wrapper(
    name: &'static str,
    flags_with_arg: &'static [&'static str],
    skip_positionals: usize,
    skips_env_assignments: bool,
    mode: WrapperMode,
) -> Wrapper {
    Wrapper {
        name,
        flags_with_arg,
        skip_positionals,
        skips_env_assignments,
        mode,
    }
}

/// The recognized wrapper families.
pub(crate) const WRAPPERS: &[Wrapper] = &[
    // Shells with -c.
    wrapper("sh", &[], 0, false, WrapperMode::ShellScript),
    wrapper("bash", &["-O", "--rcfile", "--init-file"], 0, false, WrapperMode::ShellScript),
    wrapper("zsh", &[], 0, false, WrapperMode::ShellScript),
    // Builtins that re-dispatch.
    wrapper("eval", &[], 0, false, WrapperMode::Concat),
    wrapper("exec", &["-a"], 0, false, WrapperMode::Argv),
    wrapper("command", &[], 0, false, WrapperMode::Argv),
    wrapper("builtin", &[], 0, false, WrapperMode::Argv),
    wrapper("time", &["-f", "-o"], 0, false, WrapperMode::Argv),
    // Fan-out.
    wrapper(
        "xargs",
        &["-a", "-d", "-E", "-e", "-I", "-i", "-L", "-l", "-n", "-P", "-s"],
        0,
        false,
        WrapperMode::Argv,
    ),
    wrapper("parallel", &["-j", "--jobs", "-S", "--sshlogin", "--results"], 0, false, WrapperMode::Argv),
    // Privilege escalation.
    wrapper(
        "sudo",
        &["-u", "-g", "-p", "-C", "-D", "-h", "-r", "-t", "-T", "-U"],
        0,
        true,
        WrapperMode::Argv,
    ),
    wrapper("su", &["-g", "-G", "-s"], 0, false, WrapperMode::ShellScript),
    wrapper("doas", &["-u", "-C"], 0, false, WrapperMode::Argv),
    wrapper("runuser", &["-u", "-g", "-G", "-s"], 0, false, WrapperMode::ShellScript),
    // Process and environment tweaks.
    wrapper("env", &["-u", "-S", "-C", "--chdir", "--unset", "--split-string"], 0, true, WrapperMode::Argv),
    wrapper("nohup", &[], 0, false, WrapperMode::Argv),
    wrapper("nice", &["-n", "--adjustment"], 0, false, WrapperMode::Argv),
    wrapper("ionice", &["-c", "-n", "-p", "-t"], 0, false, WrapperMode::Argv),
    wrapper("timeout", &["-k", "-s", "--kill-after", "--signal"], 1, false, WrapperMode::Argv),
    wrapper("stdbuf", &["-i", "-o", "-e"], 0, false, WrapperMode::Argv),
    // Remote / search-driven execution.
    wrapper(
        "ssh",
        &["-p", "-i", "-l", "-o", "-F", "-E", "-J", "-b", "-c", "-D", "-L", "-R", "-S", "-W", "-w"],
        1,
        false,
        WrapperMode::Concat,
    ),
    wrapper("find", &[], 0, false, WrapperMode::ExecSpan),
    wrapper("fd", &[], 0, false, WrapperMode::ExecSpan),
    // Tracing.
    wrapper("strace", &["-o", "-e", "-p", "-s", "-E", "-u", "-a", "-b"], 0, false, WrapperMode::Argv),
    wrapper("ltrace", &["-o", "-e", "-p", "-s", "-a", "-u"], 0, false, WrapperMode::Argv),
    // Locking and watching.
    wrapper("flock", &["-w", "--timeout", "-E", "--conflict-exit-code"], 1, false, WrapperMode::ShellScript),
    wrapper("watch", &["-n", "--interval", "-d", "--differences"], 0, false, WrapperMode::Concat),
    wrapper("entr", &["-s"], 0, false, WrapperMode::Argv),
    // Capability / scope managers.
    wrapper(
        "setpriv",
        &["--reuid", "--regid", "--groups", "--inh-caps", "--ambient-caps", "--bounding-set"],
        0,
        false,
        WrapperMode::Argv,
    ),
    wrapper("capsh", &["--user", "--caps", "--drop", "--uid", "--gid"], 0, false, WrapperMode::Argv),
    wrapper("cgexec", &["-g", "--sticky"], 0, false, WrapperMode::Argv),
    wrapper(
        "systemd-run",
        &["--unit", "--property", "-p", "--slice", "--uid", "--gid", "--setenv", "-E", "--working-directory", "--machine", "-M"],
        0,
        false,
        WrapperMode::Argv,
    ),
    wrapper("dbus-run-session", &["--config-file"], 0, false, WrapperMode::Argv),
    // Sourcing; the payload is a script file invocation.
    wrapper("source", &[], 0, false, WrapperMode::Argv),
    wrapper(".", &[], 0, false, WrapperMode::Argv),
];

pub(crate) fn lookup(command: &str) -> Option<&'static Wrapper> {
    // Wrapper names match on the basename, so /usr/bin/sudo unwraps too.
    let base = command.rsplit('/').next().unwrap_or(command);
    WRAPPERS.iter().find(|w| w.name == base)
}

/// The flags that start an `ExecSpan` payload.
pub(crate) const EXEC_SPAN_FLAGS: &[&str] = &["-exec", "-execdir", "-ok", "-okdir", "-x", "--exec"];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_matches_basenames() {
        assert_eq!(lookup("sudo").unwrap().name, "sudo");
        assert_eq!(lookup("/usr/bin/sudo").unwrap().name, "sudo");
        assert!(lookup("ls").is_none());
    }

    #[test]
    fn table_has_no_duplicate_names() {
        let mut names: Vec<&str> = WRAPPERS.iter().map(|w| w.name).collect();
        names.sort_unstable();
        let before = names.len();
        names.dedup();
        assert_eq!(before, names.len());
    }
}
