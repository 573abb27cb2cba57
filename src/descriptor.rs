//! Service descriptor rendering
//!
//! A [`ServiceDescriptor`] is the dialect-independent description of one
//! persistent service. Rendering it into a systemd unit, a launchd property
//! list, or a Windows service configuration is pure string building, kept
//! apart from anything that talks to a real service manager.

use crate::config::DeployConfig;
use crate::platform::{PlatformTarget, ServiceDialect, TargetPath};

/// What the service manager does when the process exits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartPolicy {
    #[default]
    Always,
}

/// Seconds the service manager waits before restarting a crashed service
pub const RESTART_DELAY_SECS: u32 = 5;

/// Dialect-independent service description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Unit name / launchd label / SCM service name
    pub id: String,
    pub description: String,
    pub executable: TargetPath,
    pub args: Vec<String>,
    pub working_dir: TargetPath,
    /// Principal the service runs as
    pub run_as: String,
    pub restart: RestartPolicy,
    /// Where stdout and stderr are appended
    pub log_file: TargetPath,
    /// Directory holding `log_file`
    pub log_dir: TargetPath,
}

impl ServiceDescriptor {
    /// Describe `binary` as a service on `target` using `config`'s layout
    pub fn for_binary(
        config: &DeployConfig,
        target: PlatformTarget,
        binary: &str,
        args: &[String],
    ) -> Self {
        let layout = target.layout(&config.app);
        let file_name = format!("{}{}", binary, target.exe_suffix());
        Self {
            id: config.service_id(target, binary),
            description: format!("{} ({})", config.description, binary),
            executable: layout.bin_dir.join(&file_name),
            args: args.to_vec(),
            working_dir: layout.data_dir.clone(),
            run_as: config.principal_for(target),
            restart: RestartPolicy::Always,
            log_file: layout.log_dir.join(&format!("{}.log", binary)),
            log_dir: layout.log_dir,
        }
    }

    /// File name of the rendered descriptor
    pub fn file_name(&self, dialect: ServiceDialect) -> String {
        format!("{}.{}", self.id, dialect.descriptor_extension())
    }

    /// Render into `dialect`'s concrete syntax
    pub fn render(&self, dialect: ServiceDialect) -> String {
        match dialect {
            ServiceDialect::Systemd => self.render_systemd(),
            ServiceDialect::Launchd => self.render_launchd(),
            ServiceDialect::Scm => self.render_scm(),
        }
    }

    fn render_systemd(&self) -> String {
        let exec_start = std::iter::once(self.executable.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(quote_systemd)
            .collect::<Vec<_>>()
            .join(" ");
        let restart = match self.restart {
            RestartPolicy::Always => "always",
        };

        format!(
            "[Unit]\n\
             Description={description}\n\
             After=network-online.target\n\
             Wants=network-online.target\n\
             \n\
             [Service]\n\
             Type=simple\n\
             User={user}\n\
             WorkingDirectory={workdir}\n\
             ExecStart={exec_start}\n\
             Restart={restart}\n\
             RestartSec={delay}\n\
             StandardOutput=append:{log}\n\
             StandardError=append:{log}\n\
             \n\
             [Install]\n\
             WantedBy=multi-user.target\n",
            description = self.description,
            user = self.run_as,
            workdir = self.working_dir,
            exec_start = exec_start,
            restart = restart,
            delay = RESTART_DELAY_SECS,
            log = self.log_file,
        )
    }

    fn render_launchd(&self) -> String {
        let mut program_arguments = String::new();
        let words = std::iter::once(self.executable.as_str())
            .chain(self.args.iter().map(String::as_str));
        for arg in words {
            program_arguments.push_str(&format!("        <string>{}</string>\n", xml_escape(arg)));
        }
        let keep_alive = match self.restart {
            RestartPolicy::Always => "<true/>",
        };

        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" \"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">\n\
             <plist version=\"1.0\">\n\
             <dict>\n\
             \x20   <key>Label</key>\n\
             \x20   <string>{label}</string>\n\
             \x20   <key>ProgramArguments</key>\n\
             \x20   <array>\n\
             {program_arguments}\
             \x20   </array>\n\
             \x20   <key>WorkingDirectory</key>\n\
             \x20   <string>{workdir}</string>\n\
             \x20   <key>UserName</key>\n\
             \x20   <string>{user}</string>\n\
             \x20   <key>RunAtLoad</key>\n\
             \x20   <true/>\n\
             \x20   <key>KeepAlive</key>\n\
             \x20   {keep_alive}\n\
             \x20   <key>ThrottleInterval</key>\n\
             \x20   <integer>{delay}</integer>\n\
             \x20   <key>StandardOutPath</key>\n\
             \x20   <string>{log}</string>\n\
             \x20   <key>StandardErrorPath</key>\n\
             \x20   <string>{log}</string>\n\
             </dict>\n\
             </plist>\n",
            label = xml_escape(&self.id),
            program_arguments = program_arguments,
            workdir = xml_escape(self.working_dir.as_str()),
            user = xml_escape(&self.run_as),
            keep_alive = keep_alive,
            delay = RESTART_DELAY_SECS,
            log = xml_escape(self.log_file.as_str()),
        )
    }

    fn render_scm(&self) -> String {
        let on_failure = match self.restart {
            RestartPolicy::Always => "restart",
        };
        format!(
            "<service>\n\
             \x20 <id>{id}</id>\n\
             \x20 <name>{id}</name>\n\
             \x20 <description>{description}</description>\n\
             \x20 <executable>{exe}</executable>\n\
             \x20 <arguments>{args}</arguments>\n\
             \x20 <workingdirectory>{workdir}</workingdirectory>\n\
             \x20 <serviceaccount>\n\
             \x20   <username>.\\{user}</username>\n\
             \x20 </serviceaccount>\n\
             \x20 <startmode>Automatic</startmode>\n\
             \x20 <onfailure action=\"{on_failure}\" delay=\"{delay} sec\"/>\n\
             \x20 <logpath>{log_dir}</logpath>\n\
             \x20 <log mode=\"append\"/>\n\
             </service>\n",
            id = xml_escape(&self.id),
            description = xml_escape(&self.description),
            exe = xml_escape(self.executable.as_str()),
            args = xml_escape(&self.windows_arguments()),
            workdir = xml_escape(self.working_dir.as_str()),
            user = xml_escape(&self.run_as),
            on_failure = on_failure,
            delay = RESTART_DELAY_SECS,
            log_dir = xml_escape(self.log_dir.as_str()),
        )
    }

    /// `binPath=` value for `sc.exe create`
    pub fn scm_bin_path(&self) -> String {
        let mut bin_path = format!("\"{}\"", self.executable);
        if !self.args.is_empty() {
            bin_path.push(' ');
            bin_path.push_str(&self.windows_arguments());
        }
        bin_path
    }

    /// Service arguments as one Windows command-line tail
    fn windows_arguments(&self) -> String {
        self.args
            .iter()
            .map(|arg| quote_windows(arg))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Quote one `ExecStart=` word if it needs it. `%` specifiers and `$`
/// variables are escaped so the word reaches the process unchanged.
fn quote_systemd(word: &str) -> String {
    let literal = word.replace('%', "%%").replace('$', "$$");
    if !literal.is_empty()
        && !literal.chars().any(|c| c.is_whitespace() || c == '"' || c == '\\')
    {
        return literal;
    }
    let escaped = literal.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{}\"", escaped)
}

/// Quote one argument the way `CommandLineToArgvW` splits it back:
/// backslashes are literal unless they precede a quote.
fn quote_windows(arg: &str) -> String {
    if !arg.is_empty() && !arg.chars().any(|c| c.is_whitespace() || c == '"') {
        return arg.to_string();
    }
    let mut out = String::from('"');
    let mut backslashes = 0;
    for c in arg.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                out.push_str(&"\\".repeat(backslashes * 2 + 1));
                out.push('"');
                backslashes = 0;
            }
            _ => {
                out.push_str(&"\\".repeat(backslashes));
                out.push(c);
                backslashes = 0;
            }
        }
    }
    out.push_str(&"\\".repeat(backslashes * 2));
    out.push('"');
    out
}

pub(crate) fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(target: PlatformTarget) -> ServiceDescriptor {
        ServiceDescriptor::for_binary(
            &DeployConfig::default(),
            target,
            "aura-server",
            &["--port".to_string(), "7654".to_string()],
        )
    }

    #[test]
    fn test_descriptor_fields_linux() {
        let d = server(PlatformTarget::Linux);
        assert_eq!(d.id, "aura-server");
        assert_eq!(d.executable.as_str(), "/usr/bin/aura-server");
        assert_eq!(d.working_dir.as_str(), "/var/lib/aura");
        assert_eq!(d.log_file.as_str(), "/var/log/aura/aura-server.log");
        assert_eq!(d.run_as, "aura");
        assert_eq!(d.file_name(ServiceDialect::Systemd), "aura-server.service");
    }

    #[test]
    fn test_render_systemd_unit() {
        let unit = server(PlatformTarget::Linux).render(ServiceDialect::Systemd);
        assert!(unit.contains("ExecStart=/usr/bin/aura-server --port 7654\n"));
        assert!(unit.contains("WorkingDirectory=/var/lib/aura\n"));
        assert!(unit.contains("User=aura\n"));
        assert!(unit.contains("Restart=always\n"));
        assert!(unit.contains("StandardOutput=append:/var/log/aura/aura-server.log\n"));
        assert!(unit.contains("StandardError=append:/var/log/aura/aura-server.log\n"));
        assert!(unit.contains("[Install]\nWantedBy=multi-user.target\n"));
    }

    #[test]
    fn test_render_launchd_plist() {
        let plist = server(PlatformTarget::MacOs).render(ServiceDialect::Launchd);
        assert!(plist.contains("<string>dev.auradb.aura-server</string>"));
        assert!(plist.contains("        <string>/usr/local/bin/aura-server</string>\n"));
        assert!(plist.contains("        <string>7654</string>\n"));
        assert!(plist.contains("<key>KeepAlive</key>\n    <true/>"));
        assert!(plist.contains("<string>_aura</string>"));
        assert!(plist.contains("<string>/usr/local/var/log/aura/aura-server.log</string>"));
        assert!(plist.trim_end().ends_with("</plist>"));
    }

    #[test]
    fn test_render_scm_config() {
        let d = server(PlatformTarget::Windows);
        let xml = d.render(ServiceDialect::Scm);
        assert!(
            xml.contains(r"<executable>C:\Program Files\aura\bin\aura-server.exe</executable>")
        );
        assert!(xml.contains("<arguments>--port 7654</arguments>"));
        assert!(xml.contains(r"<workingdirectory>C:\ProgramData\aura\data</workingdirectory>"));
        assert!(xml.contains(r#"<onfailure action="restart" delay="5 sec"/>"#));
        assert!(xml.contains(r"<logpath>C:\ProgramData\aura\logs</logpath>"));
        assert_eq!(
            d.scm_bin_path(),
            r#""C:\Program Files\aura\bin\aura-server.exe" --port 7654"#
        );
    }

    #[test]
    fn test_systemd_quoting() {
        assert_eq!(quote_systemd("--flag"), "--flag");
        assert_eq!(quote_systemd("two words"), "\"two words\"");
        assert_eq!(quote_systemd(r#"say "hi""#), r#""say \"hi\"""#);
        assert_eq!(quote_systemd(""), "\"\"");
    }

    #[test]
    fn test_systemd_specifiers_and_variables_escaped() {
        let config = DeployConfig::default();
        let args = ["--log-format=%h".to_string(), "--secret=$HOME".to_string()];
        let d =
            ServiceDescriptor::for_binary(&config, PlatformTarget::Linux, "aura-server", &args);
        let unit = d.render(ServiceDialect::Systemd);
        assert!(
            unit.contains("ExecStart=/usr/bin/aura-server --log-format=%%h --secret=$$HOME\n")
        );
        assert_eq!(quote_systemd("100% of $X"), "\"100%% of $$X\"");
    }

    #[test]
    fn test_scm_arguments_with_spaces_are_quoted() {
        let config = DeployConfig::default();
        let args = [
            "--data".to_string(),
            r"C:\ProgramData\aura\my data".to_string(),
            r"C:\trailing dir\".to_string(),
        ];
        let d =
            ServiceDescriptor::for_binary(&config, PlatformTarget::Windows, "aura-server", &args);
        assert_eq!(
            d.scm_bin_path(),
            concat!(
                r#""C:\Program Files\aura\bin\aura-server.exe" --data "#,
                r#""C:\ProgramData\aura\my data" "C:\trailing dir\\""#
            )
        );
        let xml = d.render(ServiceDialect::Scm);
        assert!(xml.contains(r"<arguments>--data &quot;C:\ProgramData\aura\my data&quot;"));
        assert_eq!(quote_windows(r#"say "hi""#), r#""say \"hi\"""#);
        assert_eq!(quote_windows(""), r#""""#);
    }

    #[test]
    fn test_xml_escape() {
        assert_eq!(xml_escape("a<b>&\"c'"), "a&lt;b&gt;&amp;&quot;c&apos;");
    }
}
