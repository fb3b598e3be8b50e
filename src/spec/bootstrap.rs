//! The transport-bootstrap specification, loaded beneath every application document.

/// Version of the built-in transport protocol. Both peers must announce the same value.
pub const BOOTSTRAP_VERSION: &str = "1.0";

/// Name of the built-in transport protocol.
pub const BOOTSTRAP_NAME: &str = "P7";

/// Bootstrap document declaring the handshake, key exchange and compatibility messages.
pub const BOOTSTRAP_SPEC: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<p7:protocol xmlns:p7="http://wired.read-write.fr/P7/Specification"
       name="P7"
       version="1.0">

  <p7:types>
    <p7:type name="bool" id="1" size="1" />
    <p7:type name="enum" id="2" size="4" />
    <p7:type name="int32" id="3" size="4" />
    <p7:type name="uint32" id="4" size="4" />
    <p7:type name="int64" id="5" size="8" />
    <p7:type name="uint64" id="6" size="8" />
    <p7:type name="double" id="7" size="8" />
    <p7:type name="string" id="8" />
    <p7:type name="uuid" id="9" size="16" />
    <p7:type name="date" id="10" size="8" />
    <p7:type name="data" id="11" />
    <p7:type name="oobdata" id="12" />
    <p7:type name="list" id="13" />
  </p7:types>

  <p7:fields>
    <p7:field name="p7.handshake.version" type="string" id="1" />
    <p7:field name="p7.handshake.protocol.name" type="string" id="2" />
    <p7:field name="p7.handshake.protocol.version" type="string" id="3" />
    <p7:field name="p7.handshake.compression" type="enum" id="4">
      <p7:enum name="p7.handshake.compression.deflate" value="1" />
    </p7:field>
    <p7:field name="p7.handshake.encryption" type="enum" id="5">
      <p7:enum name="p7.handshake.encryption.rsa_aes256_sha256" value="1" />
      <p7:enum name="p7.handshake.encryption.rsa_chacha20_sha256" value="2" />
      <p7:enum name="p7.handshake.encryption.ecdh_aes256_sha256" value="3" />
      <p7:enum name="p7.handshake.encryption.ecdh_chacha20_sha256" value="4" />
    </p7:field>
    <p7:field name="p7.handshake.checksum" type="enum" id="6">
      <p7:enum name="p7.handshake.checksum.sha1" value="1" />
      <p7:enum name="p7.handshake.checksum.sha256" value="2" />
      <p7:enum name="p7.handshake.checksum.sha512" value="3" />
    </p7:field>
    <p7:field name="p7.handshake.compatibility_check" type="bool" id="7" />

    <p7:field name="p7.encryption.public_key" type="data" id="9" />
    <p7:field name="p7.encryption.cipher.key" type="data" id="10" />
    <p7:field name="p7.encryption.cipher.iv" type="data" id="11" />
    <p7:field name="p7.encryption.username" type="data" id="12" />
    <p7:field name="p7.encryption.client_password" type="data" id="13" />
    <p7:field name="p7.encryption.server_password" type="data" id="14" />

    <p7:field name="p7.compatibility_check.specification" type="string" id="15" />
    <p7:field name="p7.compatibility_check.status" type="bool" id="16" />
  </p7:fields>

  <p7:messages>
    <p7:message name="p7.handshake.client_handshake" id="1">
      <p7:parameter field="p7.handshake.version" use="required" />
      <p7:parameter field="p7.handshake.protocol.name" use="required" />
      <p7:parameter field="p7.handshake.protocol.version" use="required" />
      <p7:parameter field="p7.handshake.encryption" />
      <p7:parameter field="p7.handshake.compression" />
      <p7:parameter field="p7.handshake.checksum" />
    </p7:message>

    <p7:message name="p7.handshake.server_handshake" id="2">
      <p7:parameter field="p7.handshake.version" use="required" />
      <p7:parameter field="p7.handshake.protocol.name" use="required" />
      <p7:parameter field="p7.handshake.protocol.version" use="required" />
      <p7:parameter field="p7.handshake.encryption" />
      <p7:parameter field="p7.handshake.compression" />
      <p7:parameter field="p7.handshake.checksum" />
      <p7:parameter field="p7.handshake.compatibility_check" />
    </p7:message>

    <p7:message name="p7.handshake.acknowledge" id="3">
      <p7:parameter field="p7.handshake.compatibility_check" />
    </p7:message>

    <p7:message name="p7.encryption.server_key" id="4">
      <p7:parameter field="p7.encryption.public_key" use="required" />
    </p7:message>

    <p7:message name="p7.encryption.client_key" id="5">
      <p7:parameter field="p7.encryption.cipher.key" use="required" />
      <p7:parameter field="p7.encryption.cipher.iv" use="required" />
      <p7:parameter field="p7.encryption.username" use="required" />
      <p7:parameter field="p7.encryption.client_password" use="required" />
    </p7:message>

    <p7:message name="p7.encryption.acknowledge" id="6">
      <p7:parameter field="p7.encryption.server_password" use="required" />
    </p7:message>

    <p7:message name="p7.encryption.authentication_error" id="7" />

    <p7:message name="p7.compatibility_check.specification" id="8">
      <p7:parameter field="p7.compatibility_check.specification" use="required" />
    </p7:message>

    <p7:message name="p7.compatibility_check.status" id="9">
      <p7:parameter field="p7.compatibility_check.status" use="required" />
    </p7:message>
  </p7:messages>

  <p7:transactions>
    <p7:transaction message="p7.handshake.client_handshake" originator="client" use="required">
      <p7:reply message="p7.handshake.server_handshake" count="1" use="required" />
    </p7:transaction>

    <p7:transaction message="p7.handshake.server_handshake" originator="server" use="required">
      <p7:reply message="p7.handshake.acknowledge" count="1" use="required" />
    </p7:transaction>

    <p7:transaction message="p7.encryption.server_key" originator="server" use="required">
      <p7:reply message="p7.encryption.client_key" count="1" use="required" />
    </p7:transaction>

    <p7:transaction message="p7.encryption.client_key" originator="client" use="required">
      <p7:or>
        <p7:reply message="p7.encryption.acknowledge" count="1" use="required" />
        <p7:reply message="p7.encryption.authentication_error" count="1" use="required" />
      </p7:or>
    </p7:transaction>

    <p7:transaction message="p7.compatibility_check.specification" originator="both" use="required">
      <p7:reply message="p7.compatibility_check.status" count="1" use="required" />
    </p7:transaction>
  </p7:transactions>
</p7:protocol>
"#;
