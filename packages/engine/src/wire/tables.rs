// packages/engine/src/wire/tables.rs
//! Metadata, type table and method table payloads

use crate::model::{Method, ProcessMetadata, RecordingMetadata, Type, TypeTrait};
use crate::utils::errors::{EngineError, Result};
use crate::wire::binary::{BinaryOutput, ByteReader};

const STATIC_FLAG: u8 = 1;
const CONSTRUCTOR_FLAG: u8 = 1 << 1;
const RETURNS_FLAG: u8 = 1 << 2;

fn write_strings<O: BinaryOutput + ?Sized>(out: &mut O, values: impl ExactSizeIterator<Item = impl AsRef<str>>) {
    out.write_u32(values.len() as u32);
    for value in values {
        out.write_str(value.as_ref());
    }
}

fn read_strings(reader: &mut ByteReader<'_>) -> Result<Vec<String>> {
    let count = reader.read_u32()?;
    let mut values = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        values.push(reader.read_str()?);
    }
    Ok(values)
}

pub fn encode_process_metadata<O: BinaryOutput + ?Sized>(metadata: &ProcessMetadata, out: &mut O) {
    out.write_u32(metadata.pid);
    out.write_str(&metadata.main_name);
    write_strings(out, metadata.args.iter());
    out.write_i64(metadata.start_time_millis);
}

pub fn decode_process_metadata(payload: &[u8]) -> Result<ProcessMetadata> {
    let mut reader = ByteReader::new(payload);
    Ok(ProcessMetadata {
        pid: reader.read_u32()?,
        main_name: reader.read_str()?,
        args: read_strings(&mut reader)?,
        start_time_millis: reader.read_i64()?,
    })
}

pub fn encode_recording_metadata<O: BinaryOutput + ?Sized>(metadata: &RecordingMetadata, out: &mut O) {
    out.write_i32(metadata.id);
    out.write_u64(metadata.thread_id);
    out.write_str(&metadata.thread_name);
    write_strings(out, metadata.start_stack_trace.iter());
    out.write_i64(metadata.start_time_millis);
    out.write_bool(metadata.complete_time_millis.is_some());
    out.write_i64(metadata.complete_time_millis.unwrap_or(0));
}

pub fn decode_recording_metadata(payload: &[u8]) -> Result<RecordingMetadata> {
    let mut reader = ByteReader::new(payload);
    let id = reader.read_i32()?;
    let thread_id = reader.read_u64()?;
    let thread_name = reader.read_str()?;
    let start_stack_trace = read_strings(&mut reader)?;
    let start_time_millis = reader.read_i64()?;
    let complete = reader.read_bool()?;
    let complete_time = reader.read_i64()?;
    Ok(RecordingMetadata {
        id,
        thread_id,
        thread_name,
        start_stack_trace,
        start_time_millis,
        complete_time_millis: complete.then_some(complete_time),
    })
}

pub fn encode_type_table<'a, O: BinaryOutput + ?Sized>(types: impl ExactSizeIterator<Item = &'a Type>, out: &mut O) {
    out.write_u32(types.len() as u32);
    for ty in types {
        out.write_u64(ty.id);
        out.write_str(&ty.name);
        out.write_u32(ty.traits.len() as u32);
        for type_trait in &ty.traits {
            out.write_u8(type_trait.code());
        }
        write_strings(out, ty.super_type_names.iter());
    }
}

pub fn decode_type_table(payload: &[u8]) -> Result<Vec<Type>> {
    let mut reader = ByteReader::new(payload);
    let count = reader.read_u32()?;
    let mut types = Vec::with_capacity(count.min(4096) as usize);
    for _ in 0..count {
        let id = reader.read_u64()?;
        let name = reader.read_str()?;
        let trait_count = reader.read_u32()?;
        let mut traits = Vec::with_capacity(trait_count.min(32) as usize);
        for _ in 0..trait_count {
            let code = reader.read_u8()?;
            let type_trait = TypeTrait::from_code(code)
                .ok_or_else(|| EngineError::DecodingFailed(format!("Unknown type trait {} on {}", code, name)))?;
            traits.push(type_trait);
        }
        let supers = read_strings(&mut reader)?;
        types.push(Type::new(id, name, traits, supers));
    }
    Ok(types)
}

pub fn encode_method_table<'a, O: BinaryOutput + ?Sized>(
    methods: impl ExactSizeIterator<Item = &'a Method>,
    out: &mut O,
) {
    out.write_u32(methods.len() as u32);
    for method in methods {
        let mut flags = 0u8;
        if method.is_static {
            flags |= STATIC_FLAG;
        }
        if method.is_constructor {
            flags |= CONSTRUCTOR_FLAG;
        }
        if method.returns_something {
            flags |= RETURNS_FLAG;
        }
        out.write_u64(method.id);
        out.write_str(&method.name);
        out.write_u64(method.declaring_type_id);
        out.write_u8(flags);
    }
}

pub fn decode_method_table(payload: &[u8]) -> Result<Vec<Method>> {
    let mut reader = ByteReader::new(payload);
    let count = reader.read_u32()?;
    let mut methods = Vec::with_capacity(count.min(4096) as usize);
    for _ in 0..count {
        let id = reader.read_u64()?;
        let name = reader.read_str()?;
        let declaring_type_id = reader.read_u64()?;
        let flags = reader.read_u8()?;
        methods.push(Method {
            id,
            name,
            declaring_type_id,
            is_static: flags & STATIC_FLAG != 0,
            is_constructor: flags & CONSTRUCTOR_FLAG != 0,
            returns_something: flags & RETURNS_FLAG != 0,
        });
    }
    Ok(methods)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_metadata_completion_flag() {
        let metadata = RecordingMetadata {
            id: 5,
            thread_id: 11,
            thread_name: "worker-1".into(),
            start_stack_trace: vec!["main".into(), "run".into()],
            start_time_millis: 1_700_000_000_000,
            complete_time_millis: None,
        };

        let mut out = Vec::new();
        encode_recording_metadata(&metadata, &mut out);
        assert_eq!(decode_recording_metadata(&out).unwrap(), metadata);

        let complete = metadata.with_complete_time(1_700_000_000_500);
        let mut out = Vec::new();
        encode_recording_metadata(&complete, &mut out);
        assert_eq!(decode_recording_metadata(&out).unwrap().complete_time_millis, Some(1_700_000_000_500));
    }

    #[test]
    fn test_tables() {
        let ty = Type::new(
            16,
            "app.Service",
            [TypeTrait::ConcreteClass, TypeTrait::Printable],
            ["app.Base".to_string()],
        );
        let method = Method {
            id: 3,
            name: "<init>".into(),
            declaring_type_id: 16,
            is_static: false,
            is_constructor: true,
            returns_something: false,
        };

        let mut out = Vec::new();
        encode_type_table([&ty].into_iter(), &mut out);
        assert_eq!(decode_type_table(&out).unwrap(), vec![ty]);

        let mut out = Vec::new();
        encode_method_table([&method].into_iter(), &mut out);
        assert_eq!(decode_method_table(&out).unwrap(), vec![method]);
    }

    #[test]
    fn test_unknown_trait_code_rejected() {
        let mut out = Vec::new();
        out.write_u32(1);
        out.write_u64(16);
        out.write_str("x");
        out.write_u32(1);
        out.write_u8(250);
        out.write_u32(0);
        assert!(decode_type_table(&out).is_err());
    }

    #[test]
    fn test_process_metadata() {
        let metadata = ProcessMetadata {
            pid: 1234,
            main_name: "app".into(),
            args: vec!["--fast".into()],
            start_time_millis: 99,
        };
        let mut out = Vec::new();
        encode_process_metadata(&metadata, &mut out);
        assert_eq!(decode_process_metadata(&out).unwrap(), metadata);
    }
}
