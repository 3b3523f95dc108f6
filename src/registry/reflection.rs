//! Protobuf descriptors for registered services.
//!
//! Builds the `FileDescriptorSet` served by gRPC reflection. Each package gets
//! one synthetic `.proto` file holding its messages and services.

use std::collections::{BTreeMap, BTreeSet};

use prost_types::field_descriptor_proto::{Label, Type};
use prost_types::{
    DescriptorProto, FieldDescriptorProto, FileDescriptorProto, FileDescriptorSet,
    MethodDescriptorProto, ServiceDescriptorProto,
};

use super::{Registry, ServiceDescriptor};
use crate::schema::json::camel_case;
use crate::schema::{FieldDescriptor, FieldKind, MessageSchema};

/// File name used for schemas without a package.
const DEFAULT_FILE: &str = "gateway.proto";

/// Describes every registered service and message.
pub fn file_descriptor_set(registry: &Registry) -> FileDescriptorSet {
    let mut files: BTreeMap<String, FileDescriptorProto> = BTreeMap::new();
    let mut deps: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    for schema in registry.schemas() {
        let file = file_for(&mut files, schema.package());
        let name = file_name(schema.package());
        for field in schema.fields() {
            if let FieldKind::Message(nested) = &field.kind {
                add_dependency(&mut deps, &name, nested.package());
            }
        }
        file.message_type.push(message_proto(&schema));
    }

    for service in registry.services() {
        let name = file_name(service.package());
        for method in &service.methods {
            add_dependency(&mut deps, &name, method.input.package());
            add_dependency(&mut deps, &name, method.output.package());
        }
        file_for(&mut files, service.package())
            .service
            .push(service_proto(&service));
    }

    for (name, file) in files.iter_mut() {
        if let Some(deps) = deps.remove(name) {
            file.dependency = deps.into_iter().collect();
        }
    }

    // Dependencies first so readers can resolve types in one pass.
    let mut ordered = Vec::with_capacity(files.len());
    let mut pending: Vec<FileDescriptorProto> = files.into_values().collect();
    while !pending.is_empty() {
        let before = pending.len();
        let mut i = 0;
        while i < pending.len() {
            let ready = pending[i]
                .dependency
                .iter()
                .all(|d| ordered.iter().any(|f: &FileDescriptorProto| f.name() == d));
            if ready {
                ordered.push(pending.remove(i));
            } else {
                i += 1;
            }
        }
        if pending.len() == before {
            // Import cycle between packages; keep the remaining order.
            ordered.append(&mut pending);
        }
    }

    FileDescriptorSet { file: ordered }
}

fn file_name(package: &str) -> String {
    if package.is_empty() {
        DEFAULT_FILE.to_string()
    } else {
        format!("{}.proto", package.replace('.', "/"))
    }
}

fn file_for<'a>(
    files: &'a mut BTreeMap<String, FileDescriptorProto>,
    package: &str,
) -> &'a mut FileDescriptorProto {
    files
        .entry(file_name(package))
        .or_insert_with(|| FileDescriptorProto {
            name: Some(file_name(package)),
            package: (!package.is_empty()).then(|| package.to_string()),
            syntax: Some("proto3".to_string()),
            ..Default::default()
        })
}

fn add_dependency(deps: &mut BTreeMap<String, BTreeSet<String>>, file: &str, package: &str) {
    let target = file_name(package);
    if target != file {
        deps.entry(file.to_string()).or_default().insert(target);
    }
}

fn type_name(schema: &MessageSchema) -> String {
    format!(".{}", schema.full_name())
}

fn message_proto(schema: &MessageSchema) -> DescriptorProto {
    DescriptorProto {
        name: Some(schema.simple_name().to_string()),
        field: schema.fields().iter().map(field_proto).collect(),
        ..Default::default()
    }
}

fn field_proto(field: &FieldDescriptor) -> FieldDescriptorProto {
    let (kind, type_name) = match &field.kind {
        FieldKind::Bool => (Type::Bool, None),
        FieldKind::Int32 => (Type::Int32, None),
        FieldKind::Int64 => (Type::Int64, None),
        FieldKind::Uint32 => (Type::Uint32, None),
        FieldKind::Uint64 => (Type::Uint64, None),
        FieldKind::Float => (Type::Float, None),
        FieldKind::Double => (Type::Double, None),
        FieldKind::String => (Type::String, None),
        FieldKind::Bytes => (Type::Bytes, None),
        FieldKind::Message(schema) => (Type::Message, Some(self::type_name(schema))),
    };
    let label = if field.repeated {
        Label::Repeated
    } else {
        Label::Optional
    };
    FieldDescriptorProto {
        name: Some(field.name.clone()),
        number: Some(field.number as i32),
        label: Some(label as i32),
        r#type: Some(kind as i32),
        type_name,
        json_name: Some(camel_case(&field.name)),
        ..Default::default()
    }
}

fn service_proto(service: &ServiceDescriptor) -> ServiceDescriptorProto {
    ServiceDescriptorProto {
        name: Some(service.simple_name().to_string()),
        method: service
            .methods
            .iter()
            .map(|m| MethodDescriptorProto {
                name: Some(m.name.clone()),
                input_type: Some(type_name(&m.input)),
                output_type: Some(type_name(&m.output)),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}
