//! Tool catalog: names, input schemas, argument types and result payloads.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use jsonschema::{Draft, Validator};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::ToolError;

pub const LIST_PROFILES: &str = "list_provisioning_profiles";
pub const IS_FREE_ACCOUNT: &str = "is_free_account";
pub const BUILD_AND_SIGN: &str = "build_and_sign_wda";

/// Schema errors quoted in a validation failure.
const MAX_SCHEMA_ERRORS: usize = 5;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
}

fn tool_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: LIST_PROFILES,
            description: "List the provisioning profiles installed for the current user. \
                Ask the user to pick one; do not select a profile on their behalf. \
                Pass the chosen UUID to is_free_account.",
            input_schema: json!({
                "type": "object",
                "properties": {},
            }),
        },
        ToolSpec {
            name: IS_FREE_ACCOUNT,
            description: "Record whether the selected profile belongs to a free developer account \
                (true) or a paid/enterprise account (false). Ask the user; do not infer it.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "isFreeAccount": {
                        "type": "boolean",
                        "description": "true for a free account profile, false for a paid or enterprise one",
                    },
                    "profileUuid": {
                        "type": "string",
                        "description": "UUID of the profile chosen from list_provisioning_profiles",
                    },
                },
                "required": ["isFreeAccount"],
            }),
        },
        ToolSpec {
            name: BUILD_AND_SIGN,
            description: "Build WebDriverAgent with xcodebuild, package it as an ipa and re-sign it \
                with the selected provisioning profile. Omitted arguments fall back to earlier calls.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "profilePath": {
                        "type": "string",
                        "description": "Path of the .mobileprovision file to sign with",
                    },
                    "selectedProvisioningProfile": {
                        "type": "object",
                        "description": "A profile object returned by list_provisioning_profiles",
                        "properties": {
                            "filePath": { "type": "string" },
                        },
                        "required": ["filePath"],
                    },
                    "projectPath": {
                        "type": "string",
                        "description": "Directory containing WebDriverAgent.xcodeproj",
                    },
                    "isFreeAccount": { "type": "boolean" },
                    "bundleId": {
                        "type": "string",
                        "description": "Bundle identifier to stamp for free accounts",
                    },
                    "outputPath": {
                        "type": "string",
                        "description": "Where to write the signed ipa",
                    },
                },
            }),
        },
    ]
}

/// Tool specs with their compiled argument validators.
pub struct ToolCatalog {
    specs: Vec<ToolSpec>,
    validators: HashMap<&'static str, Validator>,
}

impl ToolCatalog {
    /// Compile every input schema (Draft 2020-12).
    pub fn new() -> Result<Self> {
        let specs = tool_specs();
        let mut validators = HashMap::new();
        for spec in &specs {
            let validator = jsonschema::options()
                .with_draft(Draft::Draft202012)
                .build(&spec.input_schema)
                .with_context(|| format!("compile input schema for {}", spec.name))?;
            validators.insert(spec.name, validator);
        }
        Ok(Self { specs, validators })
    }

    pub fn specs(&self) -> &[ToolSpec] {
        &self.specs
    }

    pub fn contains(&self, name: &str) -> bool {
        self.validators.contains_key(name)
    }

    /// Check `args` against the tool's input schema.
    pub fn validate(&self, name: &str, args: &Value) -> Result<(), ToolError> {
        let validator = self
            .validators
            .get(name)
            .ok_or_else(|| ToolError::MethodNotFound(name.to_string()))?;
        let messages: Vec<String> = validator
            .iter_errors(args)
            .take(MAX_SCHEMA_ERRORS)
            .map(|err| err.to_string())
            .collect();
        if messages.is_empty() {
            return Ok(());
        }
        Err(ToolError::validation(format!(
            "invalid arguments for {name}: {}",
            messages.join("; ")
        )))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IsFreeAccountArgs {
    pub is_free_account: bool,
    #[serde(default)]
    pub profile_uuid: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectedProfileArg {
    pub file_path: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildAndSignArgs {
    pub profile_path: Option<PathBuf>,
    pub selected_provisioning_profile: Option<SelectedProfileArg>,
    pub project_path: Option<PathBuf>,
    pub is_free_account: Option<bool>,
    pub bundle_id: Option<String>,
    pub output_path: Option<PathBuf>,
}

impl BuildAndSignArgs {
    /// `profilePath` wins over `selectedProvisioningProfile.filePath`.
    pub fn profile_path(&self) -> Option<PathBuf> {
        self.profile_path.clone().or_else(|| {
            self.selected_provisioning_profile
                .as_ref()
                .map(|p| p.file_path.clone())
        })
    }
}

/// Decode schema-checked arguments.
pub fn decode_args<T: for<'de> Deserialize<'de>>(name: &str, args: Value) -> Result<T, ToolError> {
    serde_json::from_value(args)
        .map_err(|err| ToolError::validation(format!("invalid arguments for {name}: {err}")))
}

#[derive(Debug, Clone, Serialize)]
pub struct TextContent {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub text: String,
}

/// Payload of a `tools/call` result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub content: Vec<TextContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
}

impl ToolResult {
    /// Pretty-printed JSON text plus the same value as structured content.
    pub fn json(value: Value) -> Self {
        let text = serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
        Self {
            content: vec![TextContent { kind: "text", text }],
            is_error: None,
            structured_content: Some(value),
        }
    }

    pub fn error(err: &ToolError) -> Self {
        let message = err.to_string();
        Self {
            content: vec![TextContent {
                kind: "text",
                text: format!("Error: {message}"),
            }],
            is_error: Some(true),
            structured_content: Some(json!({ "kind": err.kind(), "message": message })),
        }
    }
}
