use std::collections::VecDeque;
use std::sync::Arc;

use adalink_core::error::{ConfigError, Error, ProtocolError, StateError};
use adalink_core::types::{Command, Fnr, Isn};
use adalink_types::query::ResolvedField;
use adalink_types::{Fdt, FieldQuery, FormatSpec, SearchTree, ShortName};
use adalink_wire::{Acbx, Buffer, BufferTag};

use crate::map::Map;
use crate::response::{Record, RecordValue, Response};
use crate::session::Session;

/// Command-option slots used by read and store calls: slot 0 carries the
/// per-command flag ('X' for LF, 'H' for hold), slot 1 the multifetch
/// marker 'M', slot 2 the continuation marker 'N'.
pub(crate) const OPT_FLAG: usize = 0;
pub(crate) const OPT_MULTIFETCH: usize = 1;
pub(crate) const OPT_CONTINUE: usize = 2;

/// Size of one multifetch element in the M buffer reply: record length,
/// per-record response code, ISN.
const MF_ELEMENT_LEN: usize = 16;

/// A record-oriented read over one file, optionally through a map. Holds
/// the compiled field query; each `read_*` entry point drives its own call
/// loop over the borrowed session.
pub struct ReadRequest<'a> {
    session: &'a Session,
    fnr: Fnr,
    map: Option<Arc<Map>>,
    fdt: Option<Fdt>,
    spec: Option<FormatSpec>,
    limit: u64,
    multifetch: u32,
    hold: bool,
}

impl<'a> ReadRequest<'a> {
    pub fn new(session: &'a Session, fnr: Fnr) -> Self {
        ReadRequest {
            session,
            fnr,
            map: None,
            fdt: None,
            spec: None,
            limit: 0,
            multifetch: 1,
            hold: false,
        }
    }

    /// Read through a map: field queries and search expressions use the
    /// map's long names.
    pub fn with_map(session: &'a Session, map: Arc<Map>) -> Self {
        let fnr = map.fnr;
        let mut request = ReadRequest::new(session, fnr);
        request.map = Some(map);
        request
    }

    /// Compile the field query. `*` selects every top-level field of the
    /// file.
    pub fn query_fields(&mut self, spec: &str) -> Result<(), Error> {
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

    /// Stop after `limit` records; 0 reads to EOF.
    pub fn set_limit(&mut self, limit: u64) {
        self.limit = limit;
    }

    /// Records per server round trip; 1 disables multifetch.
    pub fn set_multifetch(&mut self, count: u32) {
        self.multifetch = count.max(1);
    }

    /// Put read records into hold for a following update.
    pub fn set_hold(&mut self, hold: bool) {
        self.hold = hold;
    }

    /// Search read: S1 to establish the result set, then the continuation
    /// loop until EOF or limit.
    pub fn read_logical_with(&mut self, search: &str) -> Result<Response, Error> {
        let resolved = self.resolve_search(search)?;
        self.cursor(Mode::search(resolved))?.collect_response()
    }

    /// Search read delivering records one by one to `sink`. An error from
    /// the sink stops the loop and propagates. Returns the record count.
    pub fn read_logical_with_stream(
        &mut self,
        search: &str,
        mut sink: impl FnMut(Record) -> Result<(), Error>,
    ) -> Result<u64, Error> {
        let resolved = self.resolve_search(search)?;
        let mut cursor = self.cursor(Mode::search(resolved))?;
        let mut delivered = 0u64;
        while let Some(record) = cursor.next_record() {
            sink(record?)?;
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Logical-sequence read ordered by a descriptor (L3).
    pub fn read_logical_by(&mut self, descriptor: &str) -> Result<Response, Error> {
        let short = self.resolve_descriptor(descriptor)?;
        self.cursor(Mode::Descriptor(short))?.collect_response()
    }

    /// Physical-sequence read over the whole file (L2).
    pub fn read_physical(&mut self) -> Result<Response, Error> {
        self.cursor(Mode::Physical)?.collect_response()
    }

    /// Direct read of one record by ISN (L1).
    pub fn read_by_isn(&mut self, isn: Isn) -> Result<Response, Error> {
        self.cursor(Mode::ByIsn(isn))?.collect_response()
    }

    /// Search read as a pull-driven cursor; batches are fetched lazily as
    /// the caller iterates.
    pub fn cursor_with(&mut self, search: &str) -> Result<Cursor<'a>, Error> {
        let resolved = self.resolve_search(search)?;
        self.cursor(Mode::search(resolved))
    }

    /// Cursor over the physical sequence.
    pub fn cursor_physical(&mut self) -> Result<Cursor<'a>, Error> {
        self.cursor(Mode::Physical)
    }

    fn cursor(&mut self, mode: Mode) -> Result<Cursor<'a>, Error> {
        let spec = self.spec.clone().ok_or(StateError::QueryMissing)?;
        Ok(Cursor::new(
            self.session,
            self.fnr,
            spec,
            mode,
            self.limit,
            self.multifetch,
            self.hold,
        ))
    }

    fn resolve_search(&mut self, expr: &str) -> Result<(String, Vec<u8>), Error> {
        let tree = SearchTree::parse(expr)?;
        let fdt = load_fdt(self.session, self.fnr, &mut self.fdt)?;
        let map = self.map.as_deref();
        let buffers = tree.buffers(|name| {
            if let Some(map) = map {
                let field = map.field(name)?;
                return Some((field.short, field.format, field.length));
            }
            let short: ShortName = name.parse().ok()?;
            let field = fdt.field(short)?;
            Some((field.name, field.format, field.length))
        })?;
        Ok(buffers)
    }

    fn resolve_descriptor(&mut self, name: &str) -> Result<ShortName, Error> {
        if let Some(map) = self.map.as_deref() {
            if let Some(field) = map.field(name) {
                return Ok(field.short);
            }
        }
        let short: ShortName = name.parse()?;
        let fdt = load_fdt(self.session, self.fnr, &mut self.fdt)?;
        if !fdt.contains(short) {
            return Err(ConfigError::UnknownField {
                name: name.to_string(),
            }
            .into());
        }
        Ok(short)
    }
}

#[derive(Debug, Clone)]
enum Mode {
    /// Search text and value buffer, compiled up front.
    Search { text: String, values: Vec<u8> },
    Descriptor(ShortName),
    Physical,
    ByIsn(Isn),
}

impl Mode {
    fn search((text, values): (String, Vec<u8>)) -> Self {
        Mode::Search { text, values }
    }

    fn command(&self, first: bool) -> Command {
        match self {
            Mode::Search { .. } => {
                if first {
                    Command::S1
                } else {
                    Command::L1
                }
            }
            Mode::Descriptor(_) => Command::L3,
            Mode::Physical => Command::L2,
            Mode::ByIsn(_) => Command::L1,
        }
    }
}

/// Pull-driven read loop: one server call per batch, records handed out in
/// server order exactly once. Dropping the cursor releases the session's
/// read marker.
pub struct Cursor<'a> {
    session: &'a Session,
    fnr: Fnr,
    spec: FormatSpec,
    mode: Mode,
    command_id: [u8; 4],
    limit: u64,
    multifetch: u32,
    hold: bool,
    started: bool,
    eof: bool,
    count: u64,
    isn_quantity: u64,
    pending: VecDeque<Record>,
}

impl<'a> Cursor<'a> {
    fn new(
        session: &'a Session,
        fnr: Fnr,
        spec: FormatSpec,
        mode: Mode,
        limit: u64,
        multifetch: u32,
        hold: bool,
    ) -> Self {
        Cursor {
            session,
            fnr,
            spec,
            mode,
            command_id: session.allocate_command_id(),
            limit,
            multifetch,
            hold,
            started: false,
            eof: false,
            count: 0,
            isn_quantity: 0,
            pending: VecDeque::new(),
        }
    }

    /// Fetch the next record, issuing server calls as needed. `None` after
    /// EOF or once the limit is reached.
    pub fn next_record(&mut self) -> Option<Result<Record, Error>> {
        if self.limit > 0 && self.count >= self.limit {
            self.finish();
            return None;
        }
        while self.pending.is_empty() {
            if self.eof {
                self.finish();
                return None;
            }
            if let Err(e) = self.fetch_batch() {
                self.finish();
                return Some(Err(e));
            }
        }
        self.count += 1;
        self.pending.pop_front().map(Ok)
    }

    /// True when the loop stopped at the caller's limit before the server
    /// reported EOF. When the limit lands exactly on the last record this
    /// still reports true; only a further fetch would reveal the EOF, and
    /// the cursor does not issue calls past the limit.
    pub fn more(&self) -> bool {
        !self.eof && self.limit > 0 && self.count >= self.limit
    }

    fn collect_response(mut self) -> Result<Response, Error> {
        let mut records = Vec::new();
        while let Some(record) = self.next_record() {
            records.push(record?);
        }
        Ok(Response {
            records,
            isn_quantity: self.isn_quantity,
            more: self.more(),
        })
    }

    fn fetch_batch(&mut self) -> Result<(), Error> {
        let first = !self.started;
        if first {
            self.session.begin_read(self.command_id);
            self.started = true;
        }
        let command = self.mode.command(first);
        let batch = self.multifetch.max(1) as usize;

        let mut buffers = Vec::with_capacity(5);
        let mut format = Buffer::new(BufferTag::Format);
        format.write_string(&self.spec.text)?;
        buffers.push(format);
        buffers.push(Buffer::with_capacity(
            BufferTag::Record,
            self.spec.record_len * batch,
        ));
        if first {
            if let Mode::Search { text, values } = &self.mode {
                let mut sb = Buffer::new(BufferTag::Search);
                sb.write_string(text)?;
                buffers.push(sb);
                let mut vb = Buffer::new(BufferTag::Value);
                vb.write_bytes(values)?;
                buffers.push(vb);
            }
        }
        let mf_index = if batch > 1 {
            buffers.push(Buffer::with_capacity(
                BufferTag::Multifetch,
                4 + MF_ELEMENT_LEN * batch,
            ));
            Some(buffers.len() - 1)
        } else {
            None
        };

        let cid = self.command_id;
        let hold = self.hold;
        let mode = self.mode.clone();
        let result = self.session.call(command, self.fnr, &mut buffers, |acbx| {
            acbx.command_id = cid;
            stage_read_options(acbx, hold, batch, first, &mode);
        })?;
        if first {
            self.isn_quantity = result.isn_quantity;
        }

        if let Some(mf) = mf_index {
            self.parse_multifetch(&buffers[1], &buffers[mf])?;
            if result.is_eof() {
                self.eof = true;
            }
        } else if result.is_eof() {
            self.eof = true;
        } else {
            self.pending
                .push_back(materialise(&self.spec, buffers[1].used_bytes(), result.isn)?);
            if let Mode::ByIsn(_) = self.mode {
                self.eof = true;
            }
        }
        Ok(())
    }

    /// Walk the multifetch elements: each carries the record's byte length,
    /// its own response code and its ISN; code 3 ends the result set.
    fn parse_multifetch(&mut self, record_buf: &Buffer, mf_buf: &Buffer) -> Result<(), Error> {
        let elements = mf_buf.used_bytes();
        if elements.len() < 4 {
            return Err(ProtocolError::Truncated {
                at: elements.len(),
                needed: 4,
            }
            .into());
        }
        let count =
            u32::from_le_bytes([elements[0], elements[1], elements[2], elements[3]]) as usize;
        let records = record_buf.used_bytes();
        let mut record_at = 0usize;
        for i in 0..count {
            let at = 4 + i * MF_ELEMENT_LEN;
            if at + MF_ELEMENT_LEN > elements.len() {
                return Err(ProtocolError::Truncated {
                    at,
                    needed: MF_ELEMENT_LEN,
                }
                .into());
            }
            let len = u32::from_le_bytes([
                elements[at],
                elements[at + 1],
                elements[at + 2],
                elements[at + 3],
            ]) as usize;
            let response = u32::from_le_bytes([
                elements[at + 4],
                elements[at + 5],
                elements[at + 6],
                elements[at + 7],
            ]);
            let mut isn_bytes = [0u8; 8];
            isn_bytes.copy_from_slice(&elements[at + 8..at + 16]);
            let isn = Isn(u64::from_le_bytes(isn_bytes));
            if response == u32::from(adalink_core::types::RSP_EOF) {
                self.eof = true;
                break;
            }
            if record_at + len > records.len() {
                return Err(ProtocolError::Truncated {
                    at: record_at,
                    needed: len,
                }
                .into());
            }
            self.pending
                .push_back(materialise(&self.spec, &records[record_at..record_at + len], isn)?);
            record_at += len;
        }
        Ok(())
    }

    fn finish(&mut self) {
        if self.started {
            self.session.end_read();
            self.started = false;
        }
    }
}

impl Iterator for Cursor<'_> {
    type Item = Result<Record, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record()
    }
}

impl Drop for Cursor<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}

fn stage_read_options(acbx: &mut Acbx, hold: bool, batch: usize, first: bool, mode: &Mode) {
    if hold {
        acbx.set_option(OPT_FLAG, b'H');
    }
    if batch > 1 {
        acbx.set_option(OPT_MULTIFETCH, b'M');
    }
    if !first {
        acbx.set_option(OPT_CONTINUE, b'N');
    }
    match mode {
        Mode::Descriptor(short) => {
            acbx.additions1[..2].copy_from_slice(&short.bytes());
        }
        Mode::ByIsn(isn) => acbx.isn = *isn,
        Mode::Search { .. } | Mode::Physical => {}
    }
}

/// Decode one record image into a materialised record following the
/// compiled layout.
pub(crate) fn materialise(spec: &FormatSpec, image: &[u8], isn: Isn) -> Result<Record, Error> {
    let decoded = spec.decode_record(image)?;
    let mut record = Record::new(isn);
    for (slot, (name, values)) in spec.slots.iter().zip(decoded) {
        record.fields.push(RecordValue {
            name,
            short: slot.short,
            values,
        });
    }
    Ok(record)
}

pub(crate) fn load_fdt<'f>(
    session: &Session,
    fnr: Fnr,
    cache: &'f mut Option<Fdt>,
) -> Result<&'f Fdt, Error> {
    if cache.is_none() {
        *cache = Some(session.read_file_definition(fnr)?);
    }
    cache.as_ref().ok_or_else(|| {
        StateError::QueryMissing.into()
    })
}

/// Resolve a parsed field query against the map (long names) or the FDT
/// (short names) into wire descriptions ready for compilation.
pub(crate) fn resolve_query(
    session: &Session,
    fnr: Fnr,
    map: Option<&Map>,
    fdt_cache: &mut Option<Fdt>,
    query: &FieldQuery,
) -> Result<Vec<ResolvedField>, Error> {
    let fdt = load_fdt(session, fnr, fdt_cache)?;
    let mut resolved = Vec::new();

    if query.all {
        for field in fdt.leaves() {
            if field.flags.has(adalink_types::FieldFlags::SYSTEM) || field.is_dynamic() {
                continue;
            }
            let name = map
                .and_then(|m| m.field_by_short(field.name))
                .map_or_else(|| field.name.to_string(), |mf| mf.long_name.clone());
            resolved.push(ResolvedField {
                query_name: name,
                short: field.name,
                format: field.format,
                length: field.length,
                repeats: field.flags.is_periodic(),
                null_suppressed: false,
                lob: false,
                range: None,
            });
        }
    }

    for qf in &query.fields {
        let rf = if let Some(map) = map {
            let mf = map
                .field(&qf.name)
                .ok_or_else(|| ConfigError::UnknownField {
                    name: qf.name.clone(),
                })?;
            let repeats = mf.repeats()
                || fdt
                    .field(mf.short)
                    .is_some_and(|f| f.flags.is_periodic());
            ResolvedField {
                query_name: qf.name.clone(),
                short: mf.short,
                format: mf.format,
                length: mf.length,
                repeats,
                null_suppressed: qf.null_suppressed,
                lob: fdt.field(mf.short).is_some_and(|f| f.is_dynamic()),
                range: qf.range,
            }
        } else {
            let short: ShortName = qf.name.parse()?;
            let field = fdt.field(short).ok_or_else(|| ConfigError::UnknownField {
                name: qf.name.clone(),
            })?;
            ResolvedField {
                query_name: short.to_string(),
                short,
                format: field.format,
                // Dynamic fields read their size word only.
                length: if field.is_dynamic() { 4 } else { field.length },
                repeats: field.flags.is_periodic(),
                null_suppressed: qf.null_suppressed,
                lob: field.is_dynamic(),
                range: qf.range,
            }
        };
        resolved.push(rf);
    }
    Ok(resolved)
}
