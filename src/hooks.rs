//! Pre-/post-install hook rendering
//!
//! The native packaging tools run these scripts on the machine the package
//! is installed on. They perform the same work the in-process provisioner
//! and registrar do on the build host:
//!
//! - **pre-install**: create the principal if absent (id = max + 1, clamped
//!   to the reserved floor), create the data/log directories, re-apply owner
//!   and mode unconditionally
//! - **post-install**: register every service descriptor and start it
//!
//! Linux and macOS hooks are POSIX `sh`; Windows hooks are PowerShell.

use crate::descriptor::ServiceDescriptor;
use crate::platform::{InstallLayout, PlatformTarget};
use crate::provisioner::{DATA_DIR_MODE, LOG_DIR_MODE, RESERVED_ID_FLOOR};

/// Rendered hook payloads. Opaque to the package emitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookScripts {
    pub pre_install: String,
    pub post_install: String,
}

/// Render both hooks for `target`
pub fn render_hooks(
    target: PlatformTarget,
    principal: &str,
    layout: &InstallLayout,
    services: &[ServiceDescriptor],
) -> HookScripts {
    match target {
        PlatformTarget::Linux => HookScripts {
            pre_install: linux_pre_install(principal, layout),
            post_install: linux_post_install(services),
        },
        PlatformTarget::MacOs => HookScripts {
            pre_install: macos_pre_install(principal, layout),
            post_install: macos_post_install(layout, services),
        },
        PlatformTarget::Windows => HookScripts {
            pre_install: windows_pre_install(principal, layout),
            post_install: windows_post_install(principal, services),
        },
    }
}

fn sh_directories(layout: &InstallLayout) -> String {
    format!(
        "mkdir -p \"$DATA_DIR\" \"$LOG_DIR\"\n\
         chown \"$PRINCIPAL\" \"$DATA_DIR\" \"$LOG_DIR\"\n\
         chmod {data_mode:o} \"$DATA_DIR\"\n\
         chmod {log_mode:o} \"$LOG_DIR\"\n",
        data_mode = DATA_DIR_MODE,
        log_mode = LOG_DIR_MODE,
    ) + &format!("echo \"provisioned {} and {}\"\n", layout.data_dir, layout.log_dir)
}

fn sh_header(principal: &str, layout: &InstallLayout) -> String {
    format!(
        "#!/bin/sh\n\
         set -e\n\
         \n\
         PRINCIPAL=\"{principal}\"\n\
         DATA_DIR=\"{data}\"\n\
         LOG_DIR=\"{log}\"\n\
         ID_FLOOR={floor}\n\
         \n",
        principal = principal,
        data = layout.data_dir,
        log = layout.log_dir,
        floor = RESERVED_ID_FLOOR,
    )
}

fn linux_pre_install(principal: &str, layout: &InstallLayout) -> String {
    let mut script = sh_header(principal, layout);
    script.push_str(
        "if getent passwd \"$PRINCIPAL\" >/dev/null 2>&1; then\n\
         \x20   echo \"principal $PRINCIPAL already exists\"\n\
         else\n\
         \x20   MAX_ID=$(getent passwd | awk -F: '$3 < 65534 { print $3 }' | sort -n | tail -1)\n\
         \x20   NEXT_ID=$(( ${MAX_ID:-0} + 1 ))\n\
         \x20   if [ \"$NEXT_ID\" -lt \"$ID_FLOOR\" ]; then NEXT_ID=$ID_FLOOR; fi\n\
         \x20   useradd --system --uid \"$NEXT_ID\" --user-group --home-dir \"$DATA_DIR\" \\\n\
         \x20       --no-create-home --shell /usr/sbin/nologin \"$PRINCIPAL\"\n\
         fi\n\
         \n",
    );
    script.push_str(&sh_directories(layout));
    script
}

fn macos_pre_install(principal: &str, layout: &InstallLayout) -> String {
    let mut script = sh_header(principal, layout);
    script.push_str(
        "if dscl . -read \"/Users/$PRINCIPAL\" >/dev/null 2>&1; then\n\
         \x20   echo \"principal $PRINCIPAL already exists\"\n\
         else\n\
         \x20   MAX_ID=$(dscl . -list /Users UniqueID | awk '{ print $2 }' | sort -n | tail -1)\n\
         \x20   NEXT_ID=$(( ${MAX_ID:-0} + 1 ))\n\
         \x20   if [ \"$NEXT_ID\" -lt \"$ID_FLOOR\" ]; then NEXT_ID=$ID_FLOOR; fi\n\
         \x20   dscl . -create \"/Groups/$PRINCIPAL\" PrimaryGroupID \"$NEXT_ID\"\n\
         \x20   dscl . -create \"/Users/$PRINCIPAL\" UniqueID \"$NEXT_ID\"\n\
         \x20   dscl . -create \"/Users/$PRINCIPAL\" PrimaryGroupID \"$NEXT_ID\"\n\
         \x20   dscl . -create \"/Users/$PRINCIPAL\" UserShell /usr/bin/false\n\
         \x20   dscl . -create \"/Users/$PRINCIPAL\" NFSHomeDirectory \"$DATA_DIR\"\n\
         \x20   dscl . -create \"/Users/$PRINCIPAL\" IsHidden 1\n\
         fi\n\
         \n",
    );
    script.push_str(&sh_directories(layout));
    script
}

fn linux_post_install(services: &[ServiceDescriptor]) -> String {
    let mut script = String::from("#!/bin/sh\nset -e\n\nsystemctl daemon-reload\n");
    for service in services {
        script.push_str(&format!(
            "systemctl enable {id}\nsystemctl restart {id}\n",
            id = service.id
        ));
    }
    script
}

fn macos_post_install(layout: &InstallLayout, services: &[ServiceDescriptor]) -> String {
    let mut script = String::from("#!/bin/sh\nset -e\n\n");
    for service in services {
        let plist = layout
            .descriptor_dir
            .join(&format!("{}.plist", service.id));
        script.push_str(&format!(
            "launchctl bootout system/{id} 2>/dev/null || true\n\
             launchctl bootstrap system \"{plist}\"\n\
             launchctl kickstart -k system/{id}\n",
            id = service.id,
            plist = plist,
        ));
    }
    script
}

fn windows_pre_install(principal: &str, layout: &InstallLayout) -> String {
    format!(
        "$ErrorActionPreference = 'Stop'\n\
         $Principal = '{principal}'\n\
         $DataDir = '{data}'\n\
         $LogDir = '{log}'\n\
         \n\
         if (Get-LocalUser -Name $Principal -ErrorAction SilentlyContinue) {{\n\
         \x20   Write-Output \"principal $Principal already exists\"\n\
         }} else {{\n\
         \x20   New-LocalUser -Name $Principal -NoPassword -AccountNeverExpires -UserMayNotChangePassword | Out-Null\n\
         }}\n\
         \n\
         New-Item -ItemType Directory -Force -Path $DataDir, $LogDir | Out-Null\n\
         {data_acl}\n\
         {log_acl}\n",
        principal = principal,
        data = layout.data_dir,
        log = layout.log_dir,
        data_acl = icacls_line("$DataDir", "$Principal", false),
        log_acl = icacls_line("$LogDir", "$Principal", true),
    )
}

fn icacls_line(path: &str, principal: &str, world_readable: bool) -> String {
    let mut line = format!(
        "icacls {path} /setowner {principal} /inheritance:r /grant:r \"{principal}:(OI)(CI)F\" \"SYSTEM:(OI)(CI)F\" \"Administrators:(OI)(CI)F\"",
        path = path,
        principal = principal,
    );
    if world_readable {
        line.push_str(" \"Users:(OI)(CI)RX\"");
    }
    line.push_str(" | Out-Null");
    line
}

fn windows_post_install(principal: &str, services: &[ServiceDescriptor]) -> String {
    let mut script = String::from("$ErrorActionPreference = 'Stop'\n\n");
    for service in services {
        let bin_path = service.scm_bin_path().replace('\'', "''");
        script.push_str(&format!(
            "if (Get-Service -Name '{id}' -ErrorAction SilentlyContinue) {{\n\
             \x20   sc.exe config '{id}' binPath= '{bin_path}' start= auto obj= '.\\{principal}' password= ''\n\
             }} else {{\n\
             \x20   sc.exe create '{id}' binPath= '{bin_path}' start= auto obj= '.\\{principal}' password= ''\n\
             }}\n\
             sc.exe failure '{id}' reset= 86400 actions= restart/5000\n\
             Start-Service -Name '{id}'\n",
            id = service.id,
            bin_path = bin_path,
            principal = principal,
        ));
    }
    script
}
