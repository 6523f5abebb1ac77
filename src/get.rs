//! `fbx get`, `fbx status`, `fbx comment`: single-opportunity commands.

use anyhow::Result;
use serde::Serialize;

use feedback_harness_core::models::{Opportunity, ProvenanceRecord};

use crate::config::Config;
use crate::kb::KnowledgeBase;

/// An opportunity with its audit trail, as returned by `get`.
#[derive(Debug, Clone, Serialize)]
pub struct OpportunityDetail {
    #[serde(flatten)]
    pub opportunity: Opportunity,
    pub provenance: Vec<ProvenanceRecord>,
}

pub async fn run_get(config: &Config, id: &str, json: bool) -> Result<()> {
    let kb = KnowledgeBase::open(config).await?;
    let detail = async {
        let opportunity = kb.get_by_id(id).await?;
        let provenance = kb.provenance(id).await?;
        Ok::<_, feedback_harness_core::KbError>(OpportunityDetail {
            opportunity,
            provenance,
        })
    }
    .await;
    kb.close().await;
    let detail = detail?;

    if json {
        println!("{}", serde_json::to_string_pretty(&detail)?);
        return Ok(());
    }

    let o = &detail.opportunity;
    println!("--- Opportunity ---");
    println!("id:          {}", o.id);
    println!("title:       {}", o.title);
    println!("category:    {}", o.category);
    println!("severity:    {}", o.severity);
    println!("status:      {}", o.status);
    println!("frequency:   {}", o.frequency);
    println!("keywords:    {}", o.keywords.join(", "));
    println!("first_seen:  {}", o.first_seen.to_rfc3339());
    println!("last_seen:   {}", o.last_seen.to_rfc3339());
    println!();
    println!("--- Description ---");
    println!("{}", o.description);
    if !o.comments.is_empty() {
        println!();
        println!("--- Comments ---");
        println!("{}", o.comments);
    }
    println!();
    println!("--- Provenance ({}) ---", detail.provenance.len());
    for p in &detail.provenance {
        let how = match p.similarity {
            Some(s) if p.merged => format!("merged @ {:.3}", s),
            _ => "created".to_string(),
        };
        println!(
            "[{}] {} ({}) {}",
            p.recorded_at.format("%Y-%m-%d %H:%M"),
            p.content_item_id,
            how,
            p.title
        );
    }
    Ok(())
}

pub async fn run_set_status(config: &Config, id: &str, status: &str) -> Result<()> {
    let kb = KnowledgeBase::open(config).await?;
    let result = kb.set_status_str(id, status).await;
    kb.close().await;
    let status = result?;
    println!("{} -> {}", id, status);
    Ok(())
}

pub async fn run_set_comments(config: &Config, id: &str, text: &str) -> Result<()> {
    let kb = KnowledgeBase::open(config).await?;
    let result = kb.set_comments(id, text).await;
    kb.close().await;
    result?;
    println!("{} comments updated", id);
    Ok(())
}
