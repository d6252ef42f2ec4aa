// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Windows unattended setup answer files.

use std::fmt::Write;

use super::{GenerationError, SYSPREP_FILE_NAME};
use crate::vm::{GuestOs, SysprepParams, VmSpec};

const LOCALE_KEYS: [&str; 4] =
    ["InputLocale", "SystemLocale", "UILanguage", "UserLocale"];

/// Produces the sysprep answer file for a VM.
pub trait SysprepGenerator: Send + Sync {
    /// The payload file the answers are written to. It has to match the
    /// answer file format or setup will not pick it up.
    fn file_name(&self) -> &'static str {
        SYSPREP_FILE_NAME
    }

    /// Returns the answer file text, or an empty string if this generator has
    /// nothing for the VM's guest OS.
    fn generate(
        &self,
        vm: &VmSpec,
        params: &SysprepParams,
    ) -> Result<String, GenerationError>;
}

/// Generates an `unattend.xml`-style answer file for Windows guests.
#[derive(Clone, Copy, Debug, Default)]
pub struct UnattendSysprep;

impl SysprepGenerator for UnattendSysprep {
    fn generate(
        &self,
        vm: &VmSpec,
        params: &SysprepParams,
    ) -> Result<String, GenerationError> {
        if vm.os != GuestOs::Windows {
            return Ok(String::new());
        }

        let computer_name = params.computer_name.as_deref().unwrap_or(&vm.name);
        if computer_name.is_empty() {
            return Err(GenerationError::Invalid(
                "sysprep requires a computer name".to_string(),
            ));
        }

        let mut specialize = String::new();
        element(&mut specialize, 6, "ComputerName", computer_name);
        if let Some(org) = &params.org_name {
            element(&mut specialize, 6, "RegisteredOrganization", org);
        }
        if let Some(key) = &params.product_key {
            element(&mut specialize, 6, "ProductKey", key);
        }
        if let Some(tz) = &vm.timezone {
            element(&mut specialize, 6, "TimeZone", &tz.name);
        }
        if let Some(domain) = &params.domain {
            specialize.push_str("      <Identification>\n");
            element(&mut specialize, 8, "JoinDomain", domain);
            specialize.push_str("      </Identification>\n");
        }

        let mut oobe = String::new();
        if let Some(locale) = &params.locale {
            for key in LOCALE_KEYS {
                element(&mut oobe, 6, key, locale);
            }
        }
        if let Some(password) = &params.admin_password {
            oobe.push_str("      <UserAccounts>\n");
            oobe.push_str("        <AdministratorPassword>\n");
            element(&mut oobe, 10, "Value", password);
            element(&mut oobe, 10, "PlainText", "true");
            oobe.push_str("        </AdministratorPassword>\n");
            oobe.push_str("      </UserAccounts>\n");
        }

        let mut out = String::new();
        out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
        out.push_str(
            "<unattend xmlns=\"urn:schemas-microsoft-com:unattend\">\n",
        );
        component(&mut out, "specialize", &specialize);
        component(&mut out, "oobeSystem", &oobe);
        out.push_str("</unattend>\n");
        Ok(out)
    }
}

fn component(out: &mut String, pass: &str, body: &str) {
    if body.is_empty() {
        return;
    }

    // Writing to a String cannot fail.
    let _ = writeln!(out, "  <settings pass=\"{pass}\">");
    out.push_str("    <component name=\"Microsoft-Windows-Shell-Setup\">\n");
    out.push_str(body);
    out.push_str("    </component>\n");
    out.push_str("  </settings>\n");
}

fn element(out: &mut String, indent: usize, name: &str, value: &str) {
    let _ = writeln!(
        out,
        "{:indent$}<{name}>{}</{name}>",
        "",
        escape(value),
        indent = indent
    );
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}
