use std::path::Path;

use innsync_core::db::MappingFilter;
use innsync_core::models::{EntityType, MappingId, MatchMethod, NewMapping, SyncDirection};
use innsync_core::services::SyncStore;

use crate::commands::common::{
    format_mapping_lines, open_store, parse_id, print_json, property_directory,
};
use crate::error::CliError;

pub async fn run_mappings_list(
    filter: MappingFilter,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    let mappings = store.list_mappings(&filter).await?;
    if as_json {
        return print_json(&mappings);
    }
    if mappings.is_empty() {
        println!("No mappings.");
        return Ok(());
    }
    for line in format_mapping_lines(&mappings) {
        println!("{line}");
    }
    Ok(())
}

pub fn mapping_filter(
    property: Option<String>,
    entity_type: Option<&str>,
    all: bool,
    limit: usize,
) -> Result<MappingFilter, CliError> {
    Ok(MappingFilter {
        property_id: property,
        entity_type: entity_type.map(str::parse::<EntityType>).transpose()?,
        include_retired: all,
        limit,
        offset: 0,
    })
}

#[derive(Debug)]
pub struct CreateMappingArgs {
    pub property_id: String,
    pub entity_type: String,
    pub local_id: String,
    pub external_id: String,
    pub external_property: Option<String>,
    pub direction: String,
}

pub async fn create_mapping(
    store: &SyncStore,
    args: CreateMappingArgs,
) -> Result<MappingId, CliError> {
    let external_property_id = match args.external_property {
        Some(external) => external,
        None => property_directory()?
            .external_id(&args.property_id)
            .map(ToString::to_string)
            .ok_or_else(|| CliError::UnknownProperty(args.property_id.clone()))?,
    };
    let new = NewMapping {
        property_id: args.property_id,
        entity_type: args.entity_type.parse()?,
        local_id: args.local_id.trim().to_string(),
        external_id: args.external_id.trim().to_string(),
        external_property_id,
        sync_direction: args.direction.parse::<SyncDirection>()?,
        local_hash: None,
        external_hash: None,
        match_method: Some(MatchMethod::Manual),
        match_confidence: None,
    };
    let mapping = store.create_mapping(new, false).await?;
    Ok(mapping.id)
}

pub async fn run_mappings_create(args: CreateMappingArgs, db_path: &Path) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    let id = create_mapping(&store, args).await?;
    println!("Created mapping {id}");
    Ok(())
}

pub async fn run_mappings_retire(id: &str, db_path: &Path) -> Result<(), CliError> {
    let id: MappingId = parse_id("mapping id", id)?;
    let store = open_store(db_path).await?;
    let mapping = store
        .get_mapping(&id)
        .await?
        .ok_or_else(|| CliError::NotFound(format!("mapping {id}")))?;
    store.retire_mapping(&id).await?;
    println!(
        "Retired {} mapping {} <-> {}",
        mapping.entity_type, mapping.local_id, mapping.external_id
    );
    Ok(())
}
