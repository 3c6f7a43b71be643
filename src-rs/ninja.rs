/*
Copyright 2025 Google LLC

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

     https://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! `buildmk::ninja` is the downstream collaborator described by the core: it
//! walks the dependency DAG built by [`crate::dep`], expands each node's
//! commands with [`crate::command::CommandEvaluator`] the same way
//! [`crate::exec`] does, and writes the result as a `build.ninja` file plus a
//! tiny wrapper shell script instead of running anything itself.
//!
//! While commands are expanded here, [`Evaluator::avoid_io`] is set so that
//! `$(shell ...)` and friends defer to the shell's own `$(...)` at ninja-run
//! time rather than running at generation time; see
//! [`crate::func::has_no_io_in_shell_script`] for the escape hatch that keeps
//! this from breaking makefiles that feed a `$(shell ...)` result into
//! another make function.

use std::{
    collections::HashSet,
    ffi::OsString,
    fs::File,
    io::{BufWriter, Write},
    os::unix::ffi::OsStrExt,
    path::PathBuf,
    sync::Arc,
    time::SystemTime,
};

use anyhow::Result;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::{
    command::CommandEvaluator,
    dep::{DepNode, NamedDepNode},
    eval::Evaluator,
    expr::Evaluable,
    flags::FLAGS,
    symtab::Symbol,
};

fn ninja_dir() -> PathBuf {
    match &FLAGS.ninja_dir {
        Some(d) => PathBuf::from(d),
        None => PathBuf::from("."),
    }
}

fn suffixed(stem: &str, ext: &str) -> PathBuf {
    let mut name = OsString::from(stem);
    name.push(&FLAGS.ninja_suffix);
    name.push(ext);
    ninja_dir().join(name)
}

/// Path of the ninja build file this run would generate or check.
pub fn get_ninja_filename() -> PathBuf {
    suffixed("build", ".ninja")
}

/// Path of the small wrapper script that invokes `ninja -f` on the file
/// above, so callers don't need to know the suffix or directory.
pub fn get_ninja_shell_script_filename() -> PathBuf {
    suffixed("ninja", ".sh")
}

/// Path of the regeneration stamp file written by [`crate::regen`].
pub fn get_ninja_stamp_filename() -> PathBuf {
    suffixed(".build_stamp", "")
}

/// Escapes a path or identifier for use outside a `command` binding, where
/// ninja itself parses `$`, `:`, and spaces. Operates on raw bytes so paths
/// with non-UTF-8 bytes survive unchanged.
fn escape_path(s: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len());
    for &b in s {
        match b {
            b'$' => out.extend_from_slice(b"$$"),
            b':' => out.extend_from_slice(b"$:"),
            b' ' => out.extend_from_slice(b"$ "),
            _ => out.push(b),
        }
    }
    out
}

/// Escapes a shell command for use as the value of a `command` binding,
/// where only `$` is special to ninja. Operates on raw bytes so commands
/// with non-UTF-8 bytes survive unchanged.
fn escape_command(s: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len());
    for &b in s {
        if b == b'$' {
            out.extend_from_slice(b"$$");
        } else {
            out.push(b);
        }
    }
    out
}

struct NinjaWriter<'a> {
    ce: CommandEvaluator<'a>,
    out: BufWriter<File>,
    done: HashSet<Symbol>,
}

impl<'a> NinjaWriter<'a> {
    fn write_node(&mut self, n: &Arc<Mutex<DepNode>>) -> Result<()> {
        let output = n.lock().output;
        if !self.done.insert(output) {
            return Ok(());
        }

        let (deps, order_onlys, validations) = {
            let node = n.lock();
            (
                node.deps.clone(),
                node.order_onlys.clone(),
                node.validations.clone(),
            )
        };
        for (_, d) in &deps {
            self.write_node(d)?;
        }
        for (_, d) in &order_onlys {
            self.write_node(d)?;
        }
        for (_, d) in &validations {
            self.write_node(d)?;
        }

        let (is_phony, has_rule, implicit_outputs, is_restat, depfile_var, ninja_pool_var) = {
            let node = n.lock();
            (
                node.is_phony,
                node.has_rule,
                node.implicit_outputs.clone(),
                node.is_restat,
                node.depfile_var.clone(),
                node.ninja_pool_var.clone(),
            )
        };

        if is_phony {
            write!(self.out, "build ")?;
            self.out.write_all(&escape_path(&output.as_bytes()))?;
            write!(self.out, ": phony")?;
            for (sym, _) in &deps {
                write!(self.out, " ")?;
                self.out.write_all(&escape_path(&sym.as_bytes()))?;
            }
            if !order_onlys.is_empty() {
                write!(self.out, " ||")?;
                for (sym, _) in &order_onlys {
                    write!(self.out, " ")?;
                    self.out.write_all(&escape_path(&sym.as_bytes()))?;
                }
            }
            writeln!(self.out)?;
            return Ok(());
        }

        if !has_rule {
            return Ok(());
        }

        let commands = self.ce.eval(n)?;
        let rule = if commands.is_empty() {
            "phony".to_string()
        } else {
            format!("r{output}")
        };

        if !commands.is_empty() {
            writeln!(self.out, "rule {rule}")?;
            // A failing command whose `ignore_error` is set (a leading `-` in
            // the makefile) must not abort the rest of the edge, so it can't
            // just be joined with the others via `&&`.
            let mut joined = Vec::new();
            for (i, c) in commands.iter().enumerate() {
                if i > 0 {
                    joined.extend_from_slice(b" && ");
                }
                if c.ignore_error {
                    joined.extend_from_slice(b"( ");
                    joined.extend_from_slice(&c.cmd);
                    joined.extend_from_slice(b" || true )");
                } else {
                    joined.extend_from_slice(&c.cmd);
                }
            }
            write!(self.out, "  command = ")?;
            self.out.write_all(&escape_command(&joined))?;
            writeln!(self.out)?;
            writeln!(self.out, "  description = BUILDMK {output}")?;
        }

        write!(self.out, "build ")?;
        self.out.write_all(&escape_path(&output.as_bytes()))?;
        if FLAGS.use_ninja_phony_output {
            for sym in &implicit_outputs {
                write!(self.out, " ")?;
                self.out.write_all(&escape_path(&sym.as_bytes()))?;
            }
        } else if !implicit_outputs.is_empty() {
            write!(self.out, " |")?;
            for sym in &implicit_outputs {
                write!(self.out, " ")?;
                self.out.write_all(&escape_path(&sym.as_bytes()))?;
            }
        }
        write!(self.out, ": {rule}")?;
        for (sym, _) in &deps {
            write!(self.out, " ")?;
            self.out.write_all(&escape_path(&sym.as_bytes()))?;
        }
        if !order_onlys.is_empty() {
            write!(self.out, " ||")?;
            for (sym, _) in &order_onlys {
                write!(self.out, " ")?;
                self.out.write_all(&escape_path(&sym.as_bytes()))?;
            }
        }
        if FLAGS.use_ninja_validations && !validations.is_empty() {
            write!(self.out, " |@")?;
            for (sym, _) in &validations {
                write!(self.out, " ")?;
                self.out.write_all(&escape_path(&sym.as_bytes()))?;
            }
        }
        writeln!(self.out)?;

        if is_restat {
            writeln!(self.out, "  restat = 1")?;
        }
        if let Some(v) = &depfile_var {
            let path = v.read().eval_to_buf(self.ce.ev)?;
            write!(self.out, "  depfile = ")?;
            self.out.write_all(&escape_path(&path))?;
            writeln!(self.out)?;
        }
        let pool = if let Some(v) = &ninja_pool_var {
            Some(v.read().eval_to_buf(self.ce.ev)?)
        } else if !FLAGS.default_pool.is_empty() {
            Some(Bytes::from(FLAGS.default_pool.as_bytes().to_vec()))
        } else {
            None
        };
        if let Some(pool) = pool {
            write!(self.out, "  pool = ")?;
            self.out.write_all(&pool)?;
            writeln!(self.out)?;
        }

        Ok(())
    }
}

/// Writes the ninja build file, its wrapper shell script, and (via
/// [`crate::regen`]'s caller) leaves the accessed-file state for the next
/// run's regeneration check.
pub fn generate_ninja(
    nodes: &[NamedDepNode],
    ev: &mut Evaluator,
    _orig_args: &[u8],
    _start_time: SystemTime,
) -> Result<()> {
    ev.avoid_io = true;

    let dir = ninja_dir();
    if dir != PathBuf::from(".") {
        std::fs::create_dir_all(&dir)?;
    }

    let ninja_path = get_ninja_filename();
    let out = BufWriter::new(File::create(&ninja_path)?);
    let mut writer = NinjaWriter {
        ce: CommandEvaluator::new(ev)?,
        out,
        done: HashSet::new(),
    };

    if !FLAGS.no_ninja_prelude {
        writeln!(writer.out, "# Generated by buildmk. Do not edit.")?;
        writeln!(writer.out, "ninja_required_version = 1.7")?;
        writeln!(writer.out)?;
    }

    if !FLAGS.generate_empty_ninja {
        for (_, node) in nodes {
            writer.write_node(node)?;
        }
    }

    // `nodes` is exactly the set of top-level targets this run was asked to
    // build (the CLI-supplied goals, or the first rule if none were given),
    // so it's what ninja's own default set should be, regardless of which
    // node happens to carry the makefile-wide `is_default_target` flag.
    write!(writer.out, "default")?;
    for (sym, _) in nodes {
        write!(writer.out, " ")?;
        writer.out.write_all(&escape_path(&sym.as_bytes()))?;
    }
    writeln!(writer.out)?;
    writer.out.flush()?;

    let script_path = get_ninja_shell_script_filename();
    let mut script = File::create(&script_path)?;
    writeln!(script, "#!/bin/sh")?;
    writeln!(
        script,
        "exec ninja -f {} \"$@\"",
        ninja_path.to_string_lossy()
    )?;
    drop(script);
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&script_path)?.permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script_path, perms)?;
    }

    Ok(())
}
