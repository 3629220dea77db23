//! Tool registry: the model-callable actions and their dispatch onto the
//! document mutator.

use crate::docs::{DocMutator, DocsApi};
use crate::error::{Error, Result};
use crate::llm::ToolDefinition;
use serde::Deserialize;
use std::sync::Arc;

const APPEND_PARAMS: &str = r#"{
    "type": "object",
    "properties": {
        "text": { "type": "string", "description": "The text to append" }
    },
    "required": ["text"]
}"#;

#[derive(Deserialize)]
struct TitleArgs {
    title: String,
}

#[derive(Deserialize)]
struct PriorityArgs {
    priority: i64,
}

#[derive(Deserialize)]
struct AppendArgs {
    text: String,
}

/// The actions exposed to the model, dispatched by name against a channel's
/// document.
pub struct ToolRegistry<A> {
    mutator: Arc<DocMutator<A>>,
}

impl<A: DocsApi> ToolRegistry<A> {
    pub fn new(mutator: Arc<DocMutator<A>>) -> Self {
        Self { mutator }
    }

    /// Tool schemas sent with every completion request, in a fixed order.
    pub fn definitions() -> Vec<ToolDefinition> {
        let object_params = |raw: &str| -> serde_json::Value {
            serde_json::from_str(raw).unwrap_or_else(|_| serde_json::json!({ "type": "object" }))
        };

        vec![
            ToolDefinition {
                name: "ignore",
                description:
                    "Do nothing. Call this when nothing relevant happened since your last action.",
                parameters: serde_json::json!({ "type": "object", "properties": {} }),
            },
            ToolDefinition {
                name: "update_priority",
                description:
                    "Updates the incident priority. This function should be called on any relevant \
                     message, even if the priority is not changing.",
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "priority": {
                            "type": "integer",
                            "description": "The priority level, where 0 is an absolute emergency \
                                (major service disruption) and 5 is very low (minimal impact)",
                        }
                    },
                    "required": ["priority"],
                }),
            },
            ToolDefinition {
                name: "update_title",
                description:
                    "Updates the incident title. It should reflect the general impact/description \
                     of the incident, in few words. You can change it reasonably often.",
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "title": {
                            "type": "string",
                            "description": "The new document title",
                        }
                    },
                    "required": ["title"],
                }),
            },
            ToolDefinition {
                name: "append_external_status",
                description:
                    "Append a bullet item to a list of status updates. These are meant to be read \
                     by the company at large, including people not directly managing the incident \
                     and products in question, but possibly affected by it. They should be \
                     concise, but frequent (bot not frequent enough to add little or no \
                     information). For example, it would be updated when there's more info about \
                     availability and impact, but not when someone just jumped in to help.",
                parameters: object_params(APPEND_PARAMS),
            },
            ToolDefinition {
                name: "append_internal_status",
                description:
                    "Append a bullet item to a list of internal (within the incident management \
                     team) status updates. These should be updated more frequently, when more \
                     information is uncovered, or when someone gets involved or starts following \
                     a certain path of investigation. They can be more detailed. For example, any \
                     numbers (% failures, error codes) shouldn't be dropped, and you can mention \
                     co-workers by name, as well as codenames and trade secrets.",
                parameters: object_params(APPEND_PARAMS),
            },
            ToolDefinition {
                name: "append_remediations",
                description:
                    "Append a bullet item to a list of future/in-progress remediations, based on \
                     information from chat participants.",
                parameters: object_params(APPEND_PARAMS),
            },
            ToolDefinition {
                name: "append_impact",
                description:
                    "Append a bullet item to a list of impacted services, based on the \
                     conversation. You should update this whenever there are new informations on \
                     impacted systems, platforms, products and users.",
                parameters: object_params(APPEND_PARAMS),
            },
        ]
    }

    /// Execute one tool call against the channel's document.
    ///
    /// Arguments arrive as the raw JSON string from the model; a parse
    /// failure (including a missing required field) is an error, not a
    /// silent skip.
    pub async fn dispatch(&self, document_id: &str, name: &str, raw_args: &str) -> Result<()> {
        tracing::info!(tool = %name, args = %raw_args, document_id = %document_id, "dispatching tool call");

        match name {
            "ignore" => Ok(()),
            "update_priority" => {
                let args: PriorityArgs = parse_args("update_priority", raw_args)?;
                // The priority is formatted as given; values outside 0..=5 are
                // the model's problem, not ours.
                self.mutator
                    .replace_named_range(document_id, "priority", &format!("P{}", args.priority))
                    .await
            }
            "update_title" => {
                let args: TitleArgs = parse_args("update_title", raw_args)?;
                self.mutator
                    .rename_document(document_id, &format!("Incident Report - {}", args.title))
                    .await?;
                self.mutator
                    .replace_named_range(document_id, "title", &args.title)
                    .await
            }
            "append_external_status" => {
                self.append(document_id, "append_external_status", "Status", raw_args)
                    .await
            }
            "append_internal_status" => {
                self.append(document_id, "append_internal_status", "Status (Internal)", raw_args)
                    .await
            }
            "append_remediations" => {
                self.append(document_id, "append_remediations", "Remediations", raw_args)
                    .await
            }
            "append_impact" => {
                self.append(document_id, "append_impact", "Impact", raw_args)
                    .await
            }
            other => Err(Error::UnknownTool(other.to_string())),
        }
    }

    async fn append(
        &self,
        document_id: &str,
        tool: &'static str,
        header: &str,
        raw_args: &str,
    ) -> Result<()> {
        let args: AppendArgs = parse_args(tool, raw_args)?;
        self.mutator
            .append_to_list(document_id, header, &args.text)
            .await
    }
}

fn parse_args<'a, T: Deserialize<'a>>(tool: &'static str, raw: &'a str) -> Result<T> {
    serde_json::from_str(raw).map_err(|source| Error::InvalidArguments { tool, source })
}
