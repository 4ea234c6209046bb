use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;

const MODULE_AI_SEARCH: &str = "ai_search";

const DEFAULT_MODEL: &str = "claude-3-haiku-20240307";

/// Model and prompt settings for the AI search module, stored in the
/// `module_configs` table so they can be tuned without a redeploy.
#[derive(Clone, Debug)]
pub struct AiSettings {
    pub models: AiModels,
    pub prompts: AiPrompts,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AiModels {
    pub expansion_model: String,
    pub analysis_model: String,
    pub question_model: String,
    pub summary_model: String,
}

impl Default for AiModels {
    fn default() -> Self {
        default_ai_models()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AiPrompts {
    pub query_expansion: String,
    pub result_analysis: String,
    pub document_question: String,
    pub document_summary: String,
}

impl Default for AiPrompts {
    fn default() -> Self {
        default_ai_prompts()
    }
}

impl AiSettings {
    pub async fn ensure_defaults(pool: &PgPool) -> Result<()> {
        let models = serde_json::to_value(default_ai_models())?;
        let prompts = serde_json::to_value(default_ai_prompts())?;

        sqlx::query(
            "INSERT INTO module_configs (module_name, models, prompts) VALUES ($1, $2, $3)
             ON CONFLICT (module_name) DO NOTHING",
        )
        .bind(MODULE_AI_SEARCH)
        .bind(&models)
        .bind(&prompts)
        .execute(pool)
        .await?;

        Ok(())
    }

    pub async fn load(pool: &PgPool) -> Result<Self> {
        let row = sqlx::query_as::<_, ModuleConfigRow>(
            "SELECT models, prompts FROM module_configs WHERE module_name = $1",
        )
        .bind(MODULE_AI_SEARCH)
        .fetch_optional(pool)
        .await
        .context("failed to load AI search configuration from database")?
        .ok_or_else(|| anyhow!("missing module configuration for {MODULE_AI_SEARCH}"))?;

        let models: AiModels = serde_json::from_value(row.models)
            .map_err(|err| anyhow!("failed to parse AI search models: {err}"))?;
        let prompts: AiPrompts = serde_json::from_value(row.prompts)
            .map_err(|err| anyhow!("failed to parse AI search prompts: {err}"))?;

        Ok(Self { models, prompts })
    }
}

#[derive(sqlx::FromRow)]
struct ModuleConfigRow {
    models: Value,
    prompts: Value,
}

fn default_ai_models() -> AiModels {
    AiModels {
        expansion_model: DEFAULT_MODEL.to_string(),
        analysis_model: DEFAULT_MODEL.to_string(),
        question_model: DEFAULT_MODEL.to_string(),
        summary_model: DEFAULT_MODEL.to_string(),
    }
}

fn default_ai_prompts() -> AiPrompts {
    AiPrompts {
        query_expansion: "Eres un asistente de investigación científica especializado en biociencia espacial. Mejora esta consulta de búsqueda expandiéndola con términos científicos relevantes y sinónimos. Mantén el contexto de flora y fauna en microgravedad.\n\nConsulta original: \"{{QUERY}}\"\n\nResponde SOLO con los términos de búsqueda mejorados, sin explicaciones adicionales.".to_string(),
        result_analysis: "Eres un experto en biociencia espacial. Analiza brevemente (máximo 100 palabras) la relevancia de estos resultados para la consulta del usuario.\n\nConsulta: \"{{QUERY}}\"\n\nResultados encontrados:\n{{RESULTS}}\n\n¿Qué patrón o insight científico destacarías de estos resultados?".to_string(),
        document_question: "Eres un experto en biociencia espacial. Responde la siguiente pregunta basándote EXCLUSIVAMENTE en el contexto proporcionado. Si la información no está en el contexto, indica que no tienes esa información.\n\n{{CONTEXTO}}\nPregunta del usuario: {{PREGUNTA}}\n\nRespuesta (máximo 150 palabras):".to_string(),
        document_summary: "Eres un experto en biociencia espacial. Genera un resumen conciso y técnico (máximo 120 palabras) de este artículo científico:\n\nTítulo: {{TITULO}}\nAutor: {{AUTOR}}\nContenido completo:\n{{CONTENIDO}}\n\nResumen científico:".to_string(),
    }
}
