use std::sync::Arc;

use adalink_core::error::{Error, StateError};
use adalink_core::types::{Command, Fnr, Isn};
use adalink_types::{Fdt, FieldQuery, FormatSpec};
use adalink_wire::{Buffer, BufferTag};

use crate::map::Map;
use crate::read::resolve_query;
use crate::response::{Record, RecordValue};
use crate::session::Session;

/// A record-oriented store over one file, optionally through a map.
/// `store_fields` must compile the field set before the first store or
/// update; deletes need no field set. Each store request carries its own
/// command id, so it can run inside a read callback on the same session.
pub struct StoreRequest<'a> {
    session: &'a Session,
    fnr: Fnr,
    map: Option<Arc<Map>>,
    fdt: Option<Fdt>,
    spec: Option<FormatSpec>,
    command_id: [u8; 4],
}

impl<'a> StoreRequest<'a> {
    pub fn new(session: &'a Session, fnr: Fnr) -> Self {
        StoreRequest {
            session,
            fnr,
            map: None,
            fdt: None,
            spec: None,
            command_id: session.allocate_command_id(),
        }
    }

    pub fn with_map(session: &'a Session, map: Arc<Map>) -> Self {
        let fnr = map.fnr;
        let mut request = StoreRequest::new(session, fnr);
        request.map = Some(map);
        request
    }

    /// Compile the set of fields the following stores and updates write.
    pub fn store_fields(&mut self, spec: &str) -> Result<(), Error> {
        let query = FieldQuery::parse(spec)?;
        let resolved = resolve_query(
            self.session,
            self.fnr,
            self.map.as_deref(),
            &mut self.fdt,
            &query,
        )?;
        self.spec = Some(FormatSpec::compile(&resolved));
        Ok(())
    }

    /// An empty record shaped like the compiled field set, ready for
    /// `set` calls.
    pub fn new_record(&self) -> Result<Record, Error> {
        let spec = self.spec.as_ref().ok_or(StateError::StoreFieldsMissing)?;
        let mut record = Record::new(Isn(0));
        for slot in &spec.slots {
            record.fields.push(RecordValue {
                name: slot.name.clone(),
                short: slot.short,
                values: Vec::new(),
            });
        }
        Ok(record)
    }

    /// Insert a new record. N1 lets the server assign the ISN; a non-zero
    /// record ISN requests that number with N2. Returns the stored ISN.
    pub fn store(&mut self, record: &Record) -> Result<Isn, Error> {
        let image = self.encode(record)?;
        let (command, isn) = if record.isn == Isn(0) {
            (Command::N1, Isn(0))
        } else {
            (Command::N2, record.isn)
        };
        let result = self.modify(command, isn, Some(image))?;
        Ok(result)
    }

    /// Overwrite an existing record by its ISN (A1).
    pub fn update(&mut self, record: &Record) -> Result<(), Error> {
        let image = self.encode(record)?;
        self.modify(Command::A1, record.isn, Some(image))?;
        Ok(())
    }

    /// Delete a record by ISN (E1). Needs no field set.
    pub fn delete(&mut self, isn: Isn) -> Result<(), Error> {
        let cid = self.command_id;
        self.session.call(Command::E1, self.fnr, &mut [], |acbx| {
            acbx.command_id = cid;
            acbx.isn = isn;
        })?;
        Ok(())
    }

    /// Commit this session's open transaction.
    pub fn end_transaction(&self) -> Result<(), Error> {
        self.session.end_transaction()
    }

    /// Roll back this session's open transaction.
    pub fn backout_transaction(&self) -> Result<(), Error> {
        self.session.backout_transaction()
    }

    fn encode(&self, record: &Record) -> Result<Vec<u8>, Error> {
        let spec = self.spec.as_ref().ok_or(StateError::StoreFieldsMissing)?;
        let values: Vec<(String, Vec<adalink_types::FieldValue>)> = record
            .fields
            .iter()
            .map(|f| (f.name.clone(), f.values.clone()))
            .collect();
        Ok(spec.encode_record(&values)?)
    }

    fn modify(&self, command: Command, isn: Isn, image: Option<Vec<u8>>) -> Result<Isn, Error> {
        let spec = self.spec.as_ref().ok_or(StateError::StoreFieldsMissing)?;
        let mut buffers = Vec::with_capacity(2);
        let mut format = Buffer::new(BufferTag::Format);
        format.write_string(&spec.text)?;
        buffers.push(format);
        if let Some(image) = image {
            let mut rb = Buffer::new(BufferTag::Record);
            rb.write_bytes(&image)?;
            buffers.push(rb);
        }
        let cid = self.command_id;
        let result = self.session.call(command, self.fnr, &mut buffers, |acbx| {
            acbx.command_id = cid;
            acbx.isn = isn;
        })?;
        log::debug!("{} on file {} stored isn {}", command, self.fnr, result.isn);
        Ok(result.isn)
    }
}
