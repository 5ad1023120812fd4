use serde::Deserialize;

/// How document commands reach a system shell, described as a command
/// template: a program plus arguments, with `%c` marking where the command
/// line is spliced in.
///
/// The engine builds the actual process itself (working directory, piped
/// streams, the timeout guard), so this type answers exactly two
/// questions: which program to start, and with what argument vector.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "Vec<String>")]
pub struct Shell {
    program: String,
    args: Vec<String>,
}

impl Shell {
    pub fn program(&self) -> &str {
        &self.program
    }

    /// The argument vector for running `cmd`. Every `%c` argument is
    /// replaced by the command line; a template without a `%c` slot gets
    /// the command appended at the end, so `["/bin/sh", "-c"]` works too.
    pub fn argv(&self, cmd: &str) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        let mut spliced = false;
        for arg in &self.args {
            if arg == "%c" {
                argv.push(cmd.to_owned());
                spliced = true;
            } else {
                argv.push(arg.clone());
            }
        }
        if !spliced {
            argv.push(cmd.to_owned());
        }
        argv
    }
}

impl Default for Shell {
    fn default() -> Self {
        Self {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), "%c".into()],
        }
    }
}

impl TryFrom<Vec<String>> for Shell {
    type Error = &'static str;

    fn try_from(template: Vec<String>) -> Result<Self, Self::Error> {
        let mut parts = template.into_iter();
        let program = parts.next().ok_or("the shell template must name a program")?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}
