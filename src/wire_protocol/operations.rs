//! Wire protocol operational client-server communication logic.
use crate::error::Error::{ArgumentError, ResponseError};
use crate::error::Result;
use crate::wire_protocol::flags::{OpMsgFlags, OpQueryFlags, OpReplyFlags};
use crate::wire_protocol::header::{Header, OpCode, HEADER_LENGTH};

use bson::{self, Document};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};

use std::io::{Cursor, Read, Write};
use std::mem;

// Anything larger than this is treated as a corrupt stream.
const MAX_MESSAGE_SIZE_BYTES: i32 = 48_000_000;

trait ByteLength {
    /// Calculates the number of bytes in the serialized version of the struct.
    fn byte_length(&self) -> Result<i32>;
}

impl ByteLength for Document {
    fn byte_length(&self) -> Result<i32> {
        let mut temp_buffer = vec![];
        bson::encode_document(&mut temp_buffer, self)?;
        Ok(temp_buffer.len() as i32)
    }
}

/// Represents a message in the MongoDB Wire Protocol.
#[derive(Debug, Clone)]
pub enum Message {
    OpReply {
        /// The message header.
        header: Header,
        /// A bit vector of reply options.
        flags: OpReplyFlags,
        /// Uniquely identifies the cursor being returned.
        cursor_id: i64,
        /// The starting position for the cursor.
        starting_from: i32,
        /// The total number of documents being returned.
        number_returned: i32,
        /// The documents being returned.
        documents: Vec<Document>,
    },
    OpQuery {
        header: Header,
        flags: OpQueryFlags,
        /// The full qualified name of the collection, beginning with the
        /// database name and a dot separator.
        namespace: String,
        number_to_skip: i32,
        number_to_return: i32,
        query: Document,
    },
    OpMsg {
        header: Header,
        flags: OpMsgFlags,
        /// The single body section (kind 0).
        document: Document,
    },
}

impl Message {
    /// Constructs a new message request for a query.
    pub fn new_query(
        request_id: i32,
        flags: OpQueryFlags,
        namespace: String,
        number_to_skip: i32,
        number_to_return: i32,
        query: Document,
    ) -> Result<Message> {
        // flags, number_to_skip and number_to_return
        let i32_length = 3 * mem::size_of::<i32>() as i32;

        // Add an extra byte after the string for null-termination.
        let string_length = namespace.len() as i32 + 1;

        let total_length = HEADER_LENGTH + i32_length + string_length + query.byte_length()?;

        Ok(Message::OpQuery {
            header: Header::new_request(total_length, request_id, OpCode::Query),
            flags: flags,
            namespace: namespace,
            number_to_skip: number_to_skip,
            number_to_return: number_to_return,
            query: query,
        })
    }

    /// Constructs a new OP_MSG carrying a single command document.
    pub fn new_msg(request_id: i32, flags: OpMsgFlags, document: Document) -> Result<Message> {
        // flag bits and the section kind byte
        let total_length = HEADER_LENGTH
            + mem::size_of::<u32>() as i32
            + 1
            + document.byte_length()?;

        Ok(Message::OpMsg {
            header: Header::new_request(total_length, request_id, OpCode::Msg),
            flags: flags,
            document: document,
        })
    }

    pub fn header(&self) -> &Header {
        match *self {
            Message::OpReply { ref header, .. }
            | Message::OpQuery { ref header, .. }
            | Message::OpMsg { ref header, .. } => header,
        }
    }

    fn write_bson_document<W: Write>(buffer: &mut W, bson: &Document) -> Result<()> {
        let mut temp_buffer = vec![];
        bson::encode_document(&mut temp_buffer, bson)?;
        buffer.write_all(&temp_buffer)?;
        Ok(())
    }

    fn write_cstring<W: Write>(buffer: &mut W, string: &str) -> Result<()> {
        buffer.write_all(string.as_bytes())?;
        buffer.write_u8(0)?;
        Ok(())
    }

    /// Attempts to write the serialized message to a buffer.
    pub fn write<W: Write>(&self, buffer: &mut W) -> Result<()> {
        match *self {
            // Only the server should send replies
            Message::OpReply { .. } => Err(ArgumentError(
                "OP_REPLY should not be sent to the server.".to_owned(),
            )),
            Message::OpQuery {
                ref header,
                ref flags,
                ref namespace,
                number_to_skip,
                number_to_return,
                ref query,
            } => {
                header.write(buffer)?;
                buffer.write_i32::<LittleEndian>(flags.bits())?;
                Message::write_cstring(buffer, namespace)?;
                buffer.write_i32::<LittleEndian>(number_to_skip)?;
                buffer.write_i32::<LittleEndian>(number_to_return)?;
                Message::write_bson_document(buffer, query)?;
                buffer.flush()?;
                Ok(())
            }
            Message::OpMsg {
                ref header,
                ref flags,
                ref document,
            } => {
                header.write(buffer)?;
                buffer.write_u32::<LittleEndian>(flags.bits())?;
                buffer.write_u8(0)?;
                Message::write_bson_document(buffer, document)?;
                buffer.flush()?;
                Ok(())
            }
        }
    }

    // Reads one length-prefixed BSON document, returning it with its size.
    fn read_document<R: Read>(buffer: &mut R) -> Result<(Document, i32)> {
        let length = buffer.read_i32::<LittleEndian>()?;
        if length < 5 || length > MAX_MESSAGE_SIZE_BYTES {
            return Err(ResponseError(format!("Invalid document length {}.", length)));
        }

        let mut bytes = vec![0u8; length as usize];
        LittleEndian::write_i32(&mut bytes[..4], length);
        buffer.read_exact(&mut bytes[4..])?;

        let document = bson::decode_document(&mut Cursor::new(bytes))?;
        Ok((document, length))
    }

    fn read_reply<R: Read>(buffer: &mut R, header: Header) -> Result<Message> {
        let mut length = header.message_length - HEADER_LENGTH;

        let flags = buffer.read_i32::<LittleEndian>()?;
        let cursor_id = buffer.read_i64::<LittleEndian>()?;
        let starting_from = buffer.read_i32::<LittleEndian>()?;
        let number_returned = buffer.read_i32::<LittleEndian>()?;
        length -= 20;

        let mut documents = vec![];
        while length > 0 {
            let (document, size) = Message::read_document(buffer)?;
            length -= size;
            documents.push(document);
        }

        Ok(Message::OpReply {
            header: header,
            flags: OpReplyFlags::from_bits_truncate(flags),
            cursor_id: cursor_id,
            starting_from: starting_from,
            number_returned: number_returned,
            documents: documents,
        })
    }

    fn read_msg<R: Read>(buffer: &mut R, header: Header) -> Result<Message> {
        let flags = OpMsgFlags::from_bits_truncate(buffer.read_u32::<LittleEndian>()?);
        let mut length = header.message_length - HEADER_LENGTH - mem::size_of::<u32>() as i32;

        if flags.contains(OpMsgFlags::CHECKSUM_PRESENT) {
            length -= mem::size_of::<u32>() as i32;
        }

        let mut body = None;
        while length > 0 {
            let kind = buffer.read_u8()?;
            length -= 1;
            match kind {
                0 => {
                    let (document, size) = Message::read_document(buffer)?;
                    length -= size;
                    body = Some(document);
                }
                1 => {
                    // Document sequences never answer a plain command; skip them.
                    let size = buffer.read_i32::<LittleEndian>()?;
                    if size < 4 || size > length {
                        return Err(ResponseError(format!("Invalid section size {}.", size)));
                    }
                    let mut skipped = vec![0u8; size as usize - 4];
                    buffer.read_exact(&mut skipped)?;
                    length -= size;
                }
                _ => return Err(ResponseError(format!("Invalid OP_MSG section kind {}.", kind))),
            }
        }

        if flags.contains(OpMsgFlags::CHECKSUM_PRESENT) {
            let _ = buffer.read_u32::<LittleEndian>()?;
        }

        match body {
            Some(document) => Ok(Message::OpMsg {
                header: header,
                flags: flags,
                document: document,
            }),
            None => Err(ResponseError("OP_MSG reply contained no body section.".to_owned())),
        }
    }

    /// Attempts to read a serialized reply message from a buffer.
    pub fn read<R: Read>(buffer: &mut R) -> Result<Message> {
        let header = Header::read(buffer)?;
        if header.message_length > MAX_MESSAGE_SIZE_BYTES {
            return Err(ResponseError(format!(
                "Message length {} exceeds the maximum message size.",
                header.message_length
            )));
        }

        match header.op_code {
            OpCode::Reply => Message::read_reply(buffer, header),
            OpCode::Msg => Message::read_msg(buffer, header),
            opcode => Err(ResponseError(format!(
                "Expected to read a reply but instead found opcode {}",
                opcode
            ))),
        }
    }

    /// Extracts the command reply document from a server reply.
    pub fn into_reply_document(self) -> Result<Document> {
        match self {
            Message::OpReply {
                flags, mut documents, ..
            } => {
                if flags.contains(OpReplyFlags::QUERY_FAILURE) {
                    return Err(ResponseError("The server reported a query failure.".to_owned()));
                }
                if documents.is_empty() {
                    return Err(ResponseError("The server returned an empty reply.".to_owned()));
                }
                Ok(documents.swap_remove(0))
            }
            Message::OpMsg { document, .. } => Ok(document),
            Message::OpQuery { .. } => Err(ResponseError(
                "Expected a reply but received OP_QUERY.".to_owned(),
            )),
        }
    }
}
