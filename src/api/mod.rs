pub mod backup_bucket;
pub mod condition;
pub mod deployment_binding;
pub mod extension;
pub mod fleet_member;
pub mod managed_resource;
pub mod registration;
