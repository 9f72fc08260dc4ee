// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Human-readable dumps of manifest messages in a protobuf text format style.
//! Bytes fields are printed as quoted hex strings.

use std::fmt::{self, Write};

use crate::protobuf::chromeos_update_engine::{
    DeltaArchiveManifest, Extent, InstallInfo, InstallOperation, InstallProcedure, Signatures,
    install_operation, install_procedure, signatures::Signature,
};

/// Display adapter for a manifest message.
pub struct Text<'a, T>(pub &'a T);

impl<T: TextMessage> fmt::Display for Text<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut printer = Printer { f, indent: 0 };
        self.0.write_fields(&mut printer)
    }
}

pub trait TextMessage {
    fn write_fields(&self, p: &mut Printer<'_, '_>) -> fmt::Result;
}

pub struct Printer<'a, 'b> {
    f: &'a mut fmt::Formatter<'b>,
    indent: usize,
}

impl Printer<'_, '_> {
    fn write_indent(&mut self) -> fmt::Result {
        for _ in 0..self.indent {
            self.f.write_str("  ")?;
        }
        Ok(())
    }

    fn field(&mut self, name: &str, value: impl fmt::Display) -> fmt::Result {
        self.write_indent()?;
        writeln!(self.f, "{name}: {value}")
    }

    fn opt_field(&mut self, name: &str, value: Option<impl fmt::Display>) -> fmt::Result {
        match value {
            Some(v) => self.field(name, v),
            None => Ok(()),
        }
    }

    fn bytes_field(&mut self, name: &str, value: Option<&[u8]>) -> fmt::Result {
        match value {
            Some(v) => {
                self.write_indent()?;
                writeln!(self.f, "{name}: \"{}\"", hex::encode(v))
            }
            None => Ok(()),
        }
    }

    fn message(&mut self, name: &str, value: &impl TextMessage) -> fmt::Result {
        self.write_indent()?;
        writeln!(self.f, "{name} {{")?;

        self.indent += 1;
        value.write_fields(self)?;
        self.indent -= 1;

        self.write_indent()?;
        self.f.write_char('}')?;
        self.f.write_char('\n')
    }

    fn messages<'m, T: TextMessage + 'm>(
        &mut self,
        name: &str,
        values: impl IntoIterator<Item = &'m T>,
    ) -> fmt::Result {
        for value in values {
            self.message(name, value)?;
        }
        Ok(())
    }
}

/// Name of an enum value, or the raw number if it is not a known enumerator.
struct EnumValue(Option<&'static str>, i32);

impl fmt::Display for EnumValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(name) => f.write_str(name),
            None => write!(f, "{}", self.1),
        }
    }
}

impl TextMessage for Extent {
    fn write_fields(&self, p: &mut Printer<'_, '_>) -> fmt::Result {
        p.opt_field("start_block", self.start_block)?;
        p.opt_field("num_blocks", self.num_blocks)
    }
}

impl TextMessage for InstallInfo {
    fn write_fields(&self, p: &mut Printer<'_, '_>) -> fmt::Result {
        p.bytes_field("hash", self.hash.as_deref())?;
        p.opt_field("size", self.size)
    }
}

impl TextMessage for InstallOperation {
    fn write_fields(&self, p: &mut Printer<'_, '_>) -> fmt::Result {
        let name = install_operation::Type::try_from(self.r#type)
            .ok()
            .map(|t| t.as_str_name());

        p.field("type", EnumValue(name, self.r#type))?;
        p.opt_field("data_offset", self.data_offset)?;
        p.opt_field("data_length", self.data_length)?;
        p.messages("src_extents", &self.src_extents)?;
        p.opt_field("src_length", self.src_length)?;
        p.messages("dst_extents", &self.dst_extents)?;
        p.opt_field("dst_length", self.dst_length)?;
        p.bytes_field("data_sha256_hash", self.data_sha256_hash.as_deref())
    }
}

impl TextMessage for InstallProcedure {
    fn write_fields(&self, p: &mut Printer<'_, '_>) -> fmt::Result {
        if let Some(value) = self.r#type {
            let name = install_procedure::Type::try_from(value)
                .ok()
                .map(|t| t.as_str_name());

            p.field("type", EnumValue(name, value))?;
        }
        p.messages("operations", &self.operations)?;
        if let Some(info) = &self.old_info {
            p.message("old_info", info)?;
        }
        if let Some(info) = &self.new_info {
            p.message("new_info", info)?;
        }
        Ok(())
    }
}

impl TextMessage for DeltaArchiveManifest {
    fn write_fields(&self, p: &mut Printer<'_, '_>) -> fmt::Result {
        p.messages("partition_operations", &self.partition_operations)?;
        p.messages("noop_operations", &self.noop_operations)?;
        p.opt_field("block_size", self.block_size)?;
        p.opt_field("signatures_offset", self.signatures_offset)?;
        p.opt_field("signatures_size", self.signatures_size)?;
        if let Some(info) = &self.old_partition_info {
            p.message("old_partition_info", info)?;
        }
        if let Some(info) = &self.new_partition_info {
            p.message("new_partition_info", info)?;
        }
        p.messages("procedures", &self.procedures)
    }
}

impl TextMessage for Signature {
    fn write_fields(&self, p: &mut Printer<'_, '_>) -> fmt::Result {
        p.opt_field("version", self.version)?;
        p.bytes_field("data", self.data.as_deref())
    }
}

impl TextMessage for Signatures {
    fn write_fields(&self, p: &mut Printer<'_, '_>) -> fmt::Result {
        p.messages("signatures", &self.signatures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_dump() {
        let operation = InstallOperation {
            r#type: install_operation::Type::ReplaceBz.into(),
            data_offset: Some(0),
            data_length: Some(3),
            dst_extents: vec![Extent {
                start_block: Some(0),
                num_blocks: Some(1),
            }],
            data_sha256_hash: Some(vec![0xde, 0xad]),
            ..Default::default()
        };

        assert_eq!(
            Text(&operation).to_string(),
            "type: REPLACE_BZ\n\
             data_offset: 0\n\
             data_length: 3\n\
             dst_extents {\n  \
               start_block: 0\n  \
               num_blocks: 1\n\
             }\n\
             data_sha256_hash: \"dead\"\n"
        );
    }

    #[test]
    fn unknown_enum_value() {
        let operation = InstallOperation {
            r#type: 9,
            ..Default::default()
        };

        assert_eq!(Text(&operation).to_string(), "type: 9\n");
    }
}
